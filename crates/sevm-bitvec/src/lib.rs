// SPDX-License-Identifier: AGPL-3.0

//! Symbolic bit vector and boolean values for EVM TAC execution.
//!
//! Wraps Z3 bit vectors/booleans with a concrete fast path: most EVM words
//! stay concrete for most of a path's life, and folding arithmetic on
//! `BigUint` directly avoids round-tripping through the solver for every
//! `ADD`/`MUL`/comparison.

use num_bigint::{BigInt, BigUint, Sign};
use num_traits::{One, ToPrimitive, Zero};
use std::collections::HashSet;
use std::fmt;
use thiserror::Error;
use z3::ast::{Ast, Bool as Z3Bool, Dynamic, BV};
use z3::{Context, FuncDecl};

/// Raised when a caller asks for the concrete value of a symbolic term.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("value is not concrete: {0}")]
pub struct NotConcreteError(pub String);

pub type BvResult<T> = Result<T, NotConcreteError>;

fn mask(bit_size: u32) -> BigUint {
    if bit_size == 0 {
        BigUint::zero()
    } else {
        (BigUint::one() << bit_size as usize) - BigUint::one()
    }
}

fn normalize_biguint(value: BigUint, bit_size: u32) -> BigUint {
    if bit_size == 0 {
        BigUint::zero()
    } else {
        value & mask(bit_size)
    }
}

fn biguint_is_power_of_two(value: &BigUint) -> bool {
    if value.is_zero() {
        return false;
    }
    let mut minus_one = value.clone();
    minus_one -= BigUint::one();
    (value & &minus_one).is_zero()
}

fn biguint_to_bv<'ctx>(ctx: &'ctx Context, value: &BigUint, bit_size: u32) -> BV<'ctx> {
    if bit_size == 0 {
        panic!("bit size must be greater than zero");
    }

    if value.is_zero() {
        return BV::from_u64(ctx, 0, bit_size);
    }

    if let Some(small) = value.to_u64() {
        return BV::from_u64(ctx, small, bit_size);
    }

    let num_bytes = ((bit_size as usize) + 7) / 8;
    let mut bytes = value.to_bytes_be();
    if bytes.len() < num_bytes {
        let mut padded = vec![0u8; num_bytes - bytes.len()];
        padded.extend_from_slice(&bytes);
        bytes = padded;
    } else if bytes.len() > num_bytes {
        bytes = bytes[bytes.len() - num_bytes..].to_vec();
    }

    if bit_size <= 8 {
        let value = bytes.last().copied().unwrap_or(0) as u64;
        return BV::from_u64(ctx, value, bit_size);
    }

    let mut iter = bytes.into_iter();
    let first = iter.next().unwrap_or(0);
    let mut acc = BV::from_u64(ctx, first as u64, 8);
    for byte in iter {
        let next = BV::from_u64(ctx, byte as u64, 8);
        acc = acc.concat(&next);
    }

    if bit_size % 8 == 0 {
        acc
    } else {
        acc.extract(bit_size - 1, 0)
    }
}

fn apply_func_decl<'ctx>(decl: &FuncDecl<'ctx>, args: &[BV<'ctx>]) -> BV<'ctx> {
    let ast_args: Vec<&dyn Ast<'ctx>> = args.iter().map(|arg| arg as &dyn Ast<'ctx>).collect();
    decl.apply(&ast_args)
        .as_bv()
        .expect("function declaration must return a bit-vector")
}

fn to_signed_bigint(value: &BigUint, bit_size: u32) -> BigInt {
    if bit_size == 0 {
        return BigInt::zero();
    }
    let bit_size_usize = bit_size as usize;
    let sign_bit = BigUint::one() << (bit_size_usize - 1);
    if value < &sign_bit {
        BigInt::from(value.clone())
    } else {
        let modulus = BigUint::one() << bit_size_usize;
        BigInt::from_biguint(Sign::Minus, modulus - value)
    }
}

fn bigint_to_twos_complement(value: &BigInt, bit_size: u32) -> BigUint {
    if bit_size == 0 {
        return BigUint::zero();
    }
    let modulus = BigUint::one() << bit_size as usize;
    match value.sign() {
        Sign::NoSign => BigUint::zero(),
        Sign::Plus => normalize_biguint(value.to_biguint().unwrap(), bit_size),
        Sign::Minus => {
            let magnitude = (-value.clone()).to_biguint().unwrap();
            if magnitude.is_zero() {
                BigUint::zero()
            } else {
                normalize_biguint(modulus - magnitude, bit_size)
            }
        }
    }
}

#[inline]
pub fn is_power_of_two(x: u64) -> bool {
    x > 0 && (x & (x - 1)) == 0
}

pub fn to_signed(x: u64, bit_size: usize) -> i64 {
    let sign_bit = 1u64 << (bit_size - 1);
    if x & sign_bit != 0 {
        x.wrapping_sub(1 << bit_size) as i64
    } else {
        x as i64
    }
}

/// Strips the trailing `_{xid}` tag off a symbol name, mirroring the
/// `raw()` helper used by cross-execution name rewriting.
fn strip_xid_suffix(name: &str, xid: u64) -> Option<String> {
    let suffix = format!("_{xid}");
    name.strip_suffix(&suffix).map(|s| s.to_string())
}

/// Walks a term DAG collecting `(old, new)` substitution pairs for every
/// free variable tagged with `old_xid`, mirroring
/// `get_vars_non_recursive`/`translate_xid` in the Python original: numeral
/// leaves (printed with a `#` prefix) are skipped, everything else with no
/// children is a free variable and gets a freshly named replacement of the
/// same sort.
fn collect_xid_substitutions<'ctx>(
    root: &Dynamic<'ctx>,
    ctx: &'ctx Context,
    old_xid: u64,
    new_xid: u64,
) -> Vec<(Dynamic<'ctx>, Dynamic<'ctx>)> {
    let mut substitutions = Vec::new();
    let mut renamed_bases = HashSet::new();
    let mut visited = HashSet::new();
    let mut todo = vec![root.clone()];

    while let Some(node) = todo.pop() {
        let printed = node.to_string();
        if !visited.insert(printed.clone()) {
            continue;
        }

        if node.num_children() > 0 {
            todo.extend(node.children());
            continue;
        }

        if printed.starts_with('#') {
            continue;
        }

        let Some(base) = strip_xid_suffix(&printed, old_xid) else {
            continue;
        };
        if !renamed_bases.insert(base.clone()) {
            continue;
        }

        let renamed = format!("{base}_{new_xid}");
        let replacement = if let Some(bv) = node.as_bv() {
            Dynamic::from_ast(&BV::new_const(ctx, renamed.as_str(), bv.get_size()))
        } else if node.as_bool().is_some() {
            Dynamic::from_ast(&Z3Bool::new_const(ctx, renamed.as_str()))
        } else {
            continue;
        };
        substitutions.push((node, replacement));
    }

    substitutions
}

/// Symbolic or concrete boolean value.
#[derive(Clone)]
pub enum SymBool<'ctx> {
    Concrete(bool),
    Symbolic(Z3Bool<'ctx>),
}

impl<'ctx> SymBool<'ctx> {
    pub fn from_bool(_ctx: &'ctx Context, value: bool) -> Self {
        Self::Concrete(value)
    }

    pub fn from_z3(value: Z3Bool<'ctx>) -> Self {
        if let Some(simplified) = value.simplify().as_bool() {
            Self::Concrete(simplified)
        } else {
            Self::Symbolic(value)
        }
    }

    pub fn is_concrete(&self) -> bool {
        matches!(self, Self::Concrete(_))
    }

    pub fn is_symbolic(&self) -> bool {
        matches!(self, Self::Symbolic(_))
    }

    pub fn is_true(&self) -> bool {
        matches!(self, Self::Concrete(true))
    }

    pub fn is_false(&self) -> bool {
        matches!(self, Self::Concrete(false))
    }

    pub fn as_bool(&self) -> BvResult<bool> {
        match self {
            Self::Concrete(b) => Ok(*b),
            Self::Symbolic(_) => Err(NotConcreteError("boolean is symbolic".to_string())),
        }
    }

    pub fn eq(&self, other: &Self, ctx: &'ctx Context) -> Self {
        match (self, other) {
            (Self::Concrete(a), Self::Concrete(b)) => Self::Concrete(a == b),
            _ => {
                let lhs = self.as_z3(ctx);
                let rhs = other.as_z3(ctx);
                Self::from_z3(lhs._eq(&rhs))
            }
        }
    }

    pub fn as_z3(&self, ctx: &'ctx Context) -> Z3Bool<'ctx> {
        match self {
            Self::Concrete(b) => Z3Bool::from_bool(ctx, *b),
            Self::Symbolic(z3) => z3.clone(),
        }
    }

    pub fn neg(&self, ctx: &'ctx Context) -> Self {
        self.not(ctx)
    }

    pub fn bitwise_not(&self, ctx: &'ctx Context) -> Self {
        self.not(ctx)
    }

    pub fn and(&self, other: &Self, ctx: &'ctx Context) -> Self {
        match (self, other) {
            (Self::Concrete(false), _) | (_, Self::Concrete(false)) => Self::Concrete(false),
            (Self::Concrete(true), other) => other.clone(),
            (this, Self::Concrete(true)) => this.clone(),
            (Self::Symbolic(a), Self::Symbolic(b)) => Self::from_z3(Z3Bool::and(ctx, &[a, b])),
        }
    }

    pub fn bitwise_and(&self, other: &Self, ctx: &'ctx Context) -> Self {
        self.and(other, ctx)
    }

    pub fn or(&self, other: &Self, ctx: &'ctx Context) -> Self {
        match (self, other) {
            (Self::Concrete(true), _) | (_, Self::Concrete(true)) => Self::Concrete(true),
            (Self::Concrete(false), other) => other.clone(),
            (this, Self::Concrete(false)) => this.clone(),
            (Self::Symbolic(a), Self::Symbolic(b)) => Self::from_z3(Z3Bool::or(ctx, &[a, b])),
        }
    }

    pub fn bitwise_or(&self, other: &Self, ctx: &'ctx Context) -> Self {
        self.or(other, ctx)
    }

    pub fn not(&self, _ctx: &'ctx Context) -> Self {
        match self {
            Self::Concrete(b) => Self::Concrete(!b),
            Self::Symbolic(z3) => Self::from_z3(z3.not()),
        }
    }

    pub fn bitwise_xor(&self, other: &Self, ctx: &'ctx Context) -> Self {
        if self.is_true() {
            return other.bitwise_not(ctx);
        }
        if other.is_true() {
            return self.bitwise_not(ctx);
        }
        if self.is_false() {
            return other.clone();
        }
        if other.is_false() {
            return self.clone();
        }
        match (self, other) {
            (Self::Symbolic(a), Self::Symbolic(b)) => Self::from_z3(a.iff(b).not()),
            _ => unreachable!("all boolean XOR cases covered above"),
        }
    }

    pub fn is_zero(&self, ctx: &'ctx Context) -> Self {
        self.not(ctx)
    }

    pub fn is_non_zero(&self) -> Self {
        self.clone()
    }

    pub fn to_bitvec(&self, ctx: &'ctx Context, size: u32) -> SymBitVec<'ctx> {
        match self {
            Self::Concrete(true) => SymBitVec::from_u64(1, size),
            Self::Concrete(false) => SymBitVec::from_u64(0, size),
            Self::Symbolic(z3) => {
                let zero = BV::from_u64(ctx, 0, size);
                let one = BV::from_u64(ctx, 1, size);
                SymBitVec::Symbolic {
                    value: z3.ite(&one, &zero),
                    size,
                }
            }
        }
    }

    pub fn as_bv(&self, ctx: &'ctx Context, size: u32) -> SymBitVec<'ctx> {
        self.to_bitvec(ctx, size)
    }
}

impl<'ctx> fmt::Debug for SymBool<'ctx> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Concrete(b) => write!(f, "Bool({b})"),
            Self::Symbolic(z3) => write!(f, "Bool({z3})"),
        }
    }
}

/// Symbolic or concrete bit vector. `Concrete` folds arithmetic over
/// `BigUint` directly; `Symbolic` defers to Z3.
#[derive(Clone)]
pub enum SymBitVec<'ctx> {
    Concrete { value: BigUint, size: u32 },
    Symbolic { value: BV<'ctx>, size: u32 },
}

impl<'ctx> SymBitVec<'ctx> {
    pub fn from_u64(value: u64, size: u32) -> Self {
        Self::from_biguint(BigUint::from(value), size)
    }

    pub fn from_biguint(value: BigUint, size: u32) -> Self {
        Self::Concrete {
            value: normalize_biguint(value, size),
            size,
        }
    }

    pub fn from_bytes(bytes: &[u8], size: u32) -> Self {
        Self::from_biguint(BigUint::from_bytes_be(bytes), size)
    }

    pub fn from_bool(value: bool, size: u32) -> Self {
        if value {
            Self::from_u64(1, size)
        } else {
            Self::from_u64(0, size)
        }
    }

    pub fn from_z3(value: BV<'ctx>) -> Self {
        let size = value.get_size();
        Self::Symbolic { value, size }
    }

    /// Create a fresh symbolic variable.
    pub fn symbolic(ctx: &'ctx Context, name: &str, size: u32) -> Self {
        Self::Symbolic {
            value: BV::new_const(ctx, name, size),
            size,
        }
    }

    /// Create a fresh symbolic variable tagged with an execution id, e.g.
    /// `calldata_3`. Inputs and registers created this way can later be
    /// shifted to a different execution id with [`translate_xid`].
    pub fn symbolic_xid(ctx: &'ctx Context, base_name: &str, xid: u64, size: u32) -> Self {
        Self::symbolic(ctx, &format!("{base_name}_{xid}"), size)
    }

    /// Rewrite every free variable created under `old_xid` so the whole term
    /// reads as though it belonged to `new_xid`, letting a state built from
    /// one execution be composed into another without reusing its variable
    /// names. Walks the full term DAG rather than the value's bare string
    /// form, so compound expressions built from several xid-tagged subterms
    /// (e.g. two transactions' calldata combined by prior arithmetic) are
    /// translated correctly, not just a single bare-variable term.
    pub fn translate_xid(&self, ctx: &'ctx Context, old_xid: u64, new_xid: u64) -> Self {
        if old_xid == new_xid {
            return self.clone();
        }
        match self {
            Self::Concrete { .. } => self.clone(),
            Self::Symbolic { value, size } => {
                let substitutions = collect_xid_substitutions(
                    &Dynamic::from_ast(value),
                    ctx,
                    old_xid,
                    new_xid,
                );
                if substitutions.is_empty() {
                    return self.clone();
                }
                let pairs: Vec<(&Dynamic<'ctx>, &Dynamic<'ctx>)> =
                    substitutions.iter().map(|(old, new)| (old, new)).collect();
                Self::Symbolic {
                    value: value.substitute(&pairs),
                    size: *size,
                }
            }
        }
    }

    pub fn size(&self) -> u32 {
        match self {
            Self::Concrete { size, .. } => *size,
            Self::Symbolic { size, .. } => *size,
        }
    }

    pub fn is_concrete(&self) -> bool {
        matches!(self, Self::Concrete { .. })
    }

    pub fn is_symbolic(&self) -> bool {
        matches!(self, Self::Symbolic { .. })
    }

    pub fn as_u64(&self) -> BvResult<u64> {
        match self {
            Self::Concrete { value, .. } => value
                .to_u64()
                .ok_or_else(|| NotConcreteError("value too large for u64".to_string())),
            Self::Symbolic { .. } => Err(NotConcreteError("bit vector is symbolic".to_string())),
        }
    }

    pub fn as_biguint(&self) -> BvResult<BigUint> {
        match self {
            Self::Concrete { value, .. } => Ok(value.clone()),
            Self::Symbolic { .. } => Err(NotConcreteError("bit vector is symbolic".to_string())),
        }
    }

    pub fn as_z3(&self, ctx: &'ctx Context) -> BV<'ctx> {
        match self {
            Self::Concrete { value, size } => biguint_to_bv(ctx, value, *size),
            Self::Symbolic { value, .. } => value.clone(),
        }
    }

    pub fn is_zero(&self, ctx: &'ctx Context) -> SymBool<'ctx> {
        match self {
            Self::Concrete { value, .. } => SymBool::Concrete(value.is_zero()),
            Self::Symbolic { value, size } => {
                let zero = BV::from_u64(ctx, 0, *size);
                SymBool::from_z3(value._eq(&zero))
            }
        }
    }

    pub fn is_non_zero(&self, ctx: &'ctx Context) -> SymBool<'ctx> {
        self.is_zero(ctx).bitwise_not(ctx)
    }

    pub fn add(&self, other: &Self, ctx: &'ctx Context) -> Self {
        assert_eq!(self.size(), other.size());
        match (self, other) {
            (Self::Concrete { value: a, size }, Self::Concrete { value: b, .. }) => {
                Self::from_biguint(a + b, *size)
            }
            _ => Self::from_z3(self.as_z3(ctx).bvadd(&other.as_z3(ctx))),
        }
    }

    pub fn sub(&self, other: &Self, ctx: &'ctx Context) -> Self {
        assert_eq!(self.size(), other.size());
        match (self, other) {
            (Self::Concrete { value: a, size }, Self::Concrete { value: b, .. }) => {
                if a >= b {
                    Self::from_biguint(a - b, *size)
                } else {
                    let modulus = BigUint::one() << *size as usize;
                    let diff = b - a;
                    Self::from_biguint(modulus - diff, *size)
                }
            }
            _ => Self::from_z3(self.as_z3(ctx).bvsub(&other.as_z3(ctx))),
        }
    }

    pub fn mul(&self, other: &Self, ctx: &'ctx Context) -> Self {
        self.mul_with_abstraction(other, ctx, None)
    }

    pub fn mul_with_abstraction(
        &self,
        other: &Self,
        ctx: &'ctx Context,
        abstraction: Option<&FuncDecl<'ctx>>,
    ) -> Self {
        assert_eq!(self.size(), other.size());
        match (self, other) {
            (Self::Concrete { value: lhs, size }, Self::Concrete { value: rhs, .. }) => {
                Self::from_biguint(lhs * rhs, *size)
            }
            (Self::Concrete { value: lhs, size }, Self::Symbolic { value: rhs, .. }) => {
                if lhs.is_zero() {
                    return Self::from_u64(0, *size);
                }
                if lhs.is_one() {
                    return other.clone();
                }
                if biguint_is_power_of_two(lhs) {
                    let shift = lhs.bits().saturating_sub(1);
                    return other.shl(&Self::from_u64(shift, *size), ctx);
                }
                let lhs_bv = biguint_to_bv(ctx, lhs, *size);
                Self::from_z3(rhs.bvmul(&lhs_bv))
            }
            (Self::Symbolic { value: lhs, size }, Self::Concrete { value: rhs, .. }) => {
                if rhs.is_zero() {
                    return Self::from_u64(0, *size);
                }
                if rhs.is_one() {
                    return self.clone();
                }
                if biguint_is_power_of_two(rhs) {
                    let shift = rhs.bits().saturating_sub(1);
                    return self.shl(&Self::from_u64(shift, *size), ctx);
                }
                let rhs_bv = biguint_to_bv(ctx, rhs, *size);
                Self::from_z3(lhs.bvmul(&rhs_bv))
            }
            (Self::Symbolic { value: lhs, .. }, Self::Symbolic { value: rhs, .. }) => {
                if let Some(func) = abstraction {
                    return Self::from_z3(apply_func_decl(func, &[lhs.clone(), rhs.clone()]));
                }
                Self::from_z3(lhs.bvmul(rhs))
            }
        }
    }

    pub fn udiv(&self, other: &Self, ctx: &'ctx Context) -> Self {
        self.udiv_with_abstraction(other, ctx, None)
    }

    pub fn udiv_with_abstraction(
        &self,
        other: &Self,
        ctx: &'ctx Context,
        abstraction: Option<&FuncDecl<'ctx>>,
    ) -> Self {
        assert_eq!(self.size(), other.size());
        match (self, other) {
            (_, Self::Concrete { value, .. }) if value.is_zero() => Self::from_u64(0, self.size()),
            (_, Self::Concrete { value, .. }) if value.is_one() => self.clone(),
            (Self::Concrete { value: lhs, size }, Self::Concrete { value: rhs, .. }) => {
                if rhs.is_zero() {
                    Self::from_u64(0, *size)
                } else {
                    Self::from_biguint(lhs / rhs, *size)
                }
            }
            (Self::Symbolic { .. }, Self::Concrete { value: rhs, size })
                if biguint_is_power_of_two(rhs) =>
            {
                let shift = rhs.bits().saturating_sub(1);
                self.lshr(&Self::from_u64(shift, *size), ctx)
            }
            _ => {
                let lhs_bv = self.as_z3(ctx);
                let rhs_bv = other.as_z3(ctx);
                if let Some(func) = abstraction {
                    return Self::from_z3(apply_func_decl(func, &[lhs_bv.clone(), rhs_bv.clone()]));
                }
                Self::from_z3(lhs_bv.bvudiv(&rhs_bv))
            }
        }
    }

    pub fn urem(&self, other: &Self, ctx: &'ctx Context) -> Self {
        self.urem_with_abstraction(other, ctx, None)
    }

    pub fn urem_with_abstraction(
        &self,
        other: &Self,
        ctx: &'ctx Context,
        abstraction: Option<&FuncDecl<'ctx>>,
    ) -> Self {
        assert_eq!(self.size(), other.size());
        match (self, other) {
            (_, Self::Concrete { value, .. }) if value.is_zero() => self.clone(),
            (Self::Concrete { value: lhs, size }, Self::Concrete { value: rhs, .. }) => {
                if rhs.is_zero() {
                    self.clone()
                } else {
                    Self::from_biguint(lhs % rhs, *size)
                }
            }
            (_, Self::Concrete { value: rhs, size }) if biguint_is_power_of_two(rhs) => {
                let bits = rhs.bits().saturating_sub(1) as u32;
                if bits == 0 {
                    return Self::from_u64(0, *size);
                }
                let truncated = self.truncate(bits, ctx);
                truncated.zero_extend(*size, ctx)
            }
            _ => {
                let lhs_bv = self.as_z3(ctx);
                let rhs_bv = other.as_z3(ctx);
                if let Some(func) = abstraction {
                    return Self::from_z3(apply_func_decl(func, &[lhs_bv.clone(), rhs_bv.clone()]));
                }
                Self::from_z3(lhs_bv.bvurem(&rhs_bv))
            }
        }
    }

    pub fn sdiv(&self, other: &Self, ctx: &'ctx Context) -> Self {
        self.sdiv_with_abstraction(other, ctx, None)
    }

    pub fn sdiv_with_abstraction(
        &self,
        other: &Self,
        ctx: &'ctx Context,
        abstraction: Option<&FuncDecl<'ctx>>,
    ) -> Self {
        assert_eq!(self.size(), other.size());
        match (self, other) {
            (_, Self::Concrete { value, .. }) if value.is_zero() => Self::from_u64(0, self.size()),
            (_, Self::Concrete { value, .. }) if value.is_one() => self.clone(),
            (Self::Concrete { value: lhs, size }, Self::Concrete { value: rhs, .. }) => {
                if rhs.is_zero() {
                    return Self::from_u64(0, *size);
                }
                let lhs_signed = to_signed_bigint(lhs, *size);
                let rhs_signed = to_signed_bigint(rhs, *size);
                Self::from_biguint(
                    bigint_to_twos_complement(&(lhs_signed / rhs_signed), *size),
                    *size,
                )
            }
            _ => {
                let lhs_bv = self.as_z3(ctx);
                let rhs_bv = other.as_z3(ctx);
                if let Some(func) = abstraction {
                    return Self::from_z3(apply_func_decl(func, &[lhs_bv.clone(), rhs_bv.clone()]));
                }
                Self::from_z3(lhs_bv.bvsdiv(&rhs_bv))
            }
        }
    }

    pub fn smod(&self, other: &Self, ctx: &'ctx Context) -> Self {
        self.smod_with_abstraction(other, ctx, None)
    }

    pub fn smod_with_abstraction(
        &self,
        other: &Self,
        ctx: &'ctx Context,
        abstraction: Option<&FuncDecl<'ctx>>,
    ) -> Self {
        assert_eq!(self.size(), other.size());
        match (self, other) {
            (_, Self::Concrete { value, .. }) if value.is_zero() => self.clone(),
            (Self::Concrete { value: lhs, size }, Self::Concrete { value: rhs, .. }) => {
                if rhs.is_zero() {
                    return self.clone();
                }
                let lhs_signed = to_signed_bigint(lhs, *size);
                let rhs_signed = to_signed_bigint(rhs, *size);
                Self::from_biguint(
                    bigint_to_twos_complement(&(lhs_signed % rhs_signed), *size),
                    *size,
                )
            }
            _ => {
                let lhs_bv = self.as_z3(ctx);
                let rhs_bv = other.as_z3(ctx);
                if let Some(func) = abstraction {
                    return Self::from_z3(apply_func_decl(func, &[lhs_bv.clone(), rhs_bv.clone()]));
                }
                Self::from_z3(lhs_bv.bvsrem(&rhs_bv))
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn exp(
        &self,
        other: &Self,
        ctx: &'ctx Context,
        exp_abstraction: Option<&FuncDecl<'ctx>>,
        mul_abstraction: Option<&FuncDecl<'ctx>>,
        smt_exp_by_const: u32,
    ) -> BvResult<Self> {
        assert_eq!(self.size(), other.size());

        if other.is_concrete() {
            let exponent = other.as_biguint()?;
            if exponent.is_zero() {
                return Ok(Self::from_u64(1, self.size()));
            }
            if exponent.is_one() {
                return Ok(self.clone());
            }
            if self.is_concrete() {
                let base = self.as_biguint()?;
                let modulus = BigUint::one() << self.size() as usize;
                return Ok(Self::from_biguint(base.modpow(&exponent, &modulus), self.size()));
            }
            if let Some(exp_u32) = exponent.to_u32() {
                if exp_u32 <= smt_exp_by_const {
                    if exp_u32 == 0 {
                        return Ok(Self::from_u64(1, self.size()));
                    }
                    let mut acc = self.clone();
                    for _ in 1..exp_u32 {
                        acc = acc.mul_with_abstraction(self, ctx, mul_abstraction);
                    }
                    return Ok(acc);
                }
            }
        }

        let abstraction = exp_abstraction
            .ok_or_else(|| NotConcreteError("missing SMT abstraction for exponentiation".to_string()))?;
        let lhs_bv = self.as_z3(ctx);
        let rhs_bv = other.as_z3(ctx);
        Ok(Self::from_z3(apply_func_decl(abstraction, &[lhs_bv, rhs_bv])))
    }

    pub fn addmod(
        &self,
        other: &Self,
        modulus: &Self,
        ctx: &'ctx Context,
        abstraction: Option<&FuncDecl<'ctx>>,
    ) -> Self {
        assert_eq!(self.size(), other.size());
        assert_eq!(self.size(), modulus.size());

        if self.is_concrete() && other.is_concrete() && modulus.is_concrete() {
            let a = self.as_biguint().unwrap();
            let b = other.as_biguint().unwrap();
            let n = modulus.as_biguint().unwrap();
            if n.is_zero() {
                return Self::from_u64(0, self.size());
            }
            return Self::from_biguint((a + b) % n, self.size());
        }

        let new_size = self.size() + 8;
        let sum = self
            .zero_extend(new_size, ctx)
            .add(&other.zero_extend(new_size, ctx), ctx);
        let modulus_ext = modulus.zero_extend(new_size, ctx);
        sum.urem_with_abstraction(&modulus_ext, ctx, abstraction)
            .truncate(self.size(), ctx)
    }

    pub fn mulmod(
        &self,
        other: &Self,
        modulus: &Self,
        ctx: &'ctx Context,
        mul_abstraction: Option<&FuncDecl<'ctx>>,
        mod_abstraction: Option<&FuncDecl<'ctx>>,
    ) -> Self {
        assert_eq!(self.size(), other.size());
        assert_eq!(self.size(), modulus.size());

        if self.is_concrete() && other.is_concrete() && modulus.is_concrete() {
            let a = self.as_biguint().unwrap();
            let b = other.as_biguint().unwrap();
            let n = modulus.as_biguint().unwrap();
            if n.is_zero() {
                return Self::from_u64(0, self.size());
            }
            return Self::from_biguint((a * b) % n, self.size());
        }

        let new_size = self.size() * 2;
        let product = self.zero_extend(new_size, ctx).mul_with_abstraction(
            &other.zero_extend(new_size, ctx),
            ctx,
            mul_abstraction,
        );
        let modulus_ext = modulus.zero_extend(new_size, ctx);
        product
            .urem_with_abstraction(&modulus_ext, ctx, mod_abstraction)
            .truncate(self.size(), ctx)
    }

    pub fn signextend(&self, byte_index: u32, _ctx: &'ctx Context) -> Self {
        assert_eq!(self.size(), 256, "signextend expects a 256-bit value");
        if byte_index >= 31 {
            return self.clone();
        }
        let bits = (byte_index + 1) * 8;
        match self {
            Self::Concrete { value, .. } => {
                let truncated = normalize_biguint(value.clone(), bits);
                let sign_bit = BigUint::one() << (bits as usize - 1);
                if truncated >= sign_bit {
                    let extension_mask = mask(256) ^ mask(bits);
                    Self::from_biguint(truncated | extension_mask, 256)
                } else {
                    Self::from_biguint(truncated, 256)
                }
            }
            Self::Symbolic { value, .. } => {
                let low = value.extract(bits - 1, 0);
                Self::from_z3(low.sign_ext(256 - bits))
            }
        }
    }

    pub fn zero_extend(&self, new_size: u32, _ctx: &'ctx Context) -> Self {
        assert!(new_size >= self.size(), "can only zero-extend to a larger size");
        if new_size == self.size() {
            return self.clone();
        }
        match self {
            Self::Concrete { value, .. } => Self::from_biguint(value.clone(), new_size),
            Self::Symbolic { value, size } => Self::from_z3(value.zero_ext(new_size - size)),
        }
    }

    pub fn truncate(&self, new_size: u32, _ctx: &'ctx Context) -> Self {
        assert!(new_size <= self.size(), "can only truncate to a smaller size");
        if new_size == self.size() {
            return self.clone();
        }
        match self {
            Self::Concrete { value, .. } => Self::from_biguint(value.clone(), new_size),
            Self::Symbolic { value, .. } => Self::from_z3(value.extract(new_size.saturating_sub(1), 0)),
        }
    }

    pub fn concat(&self, other: &Self) -> Self {
        let new_size = self.size() + other.size();
        match (self, other) {
            (Self::Concrete { value: a, .. }, Self::Concrete { value: b, size: b_size }) => {
                Self::from_biguint((a << (*b_size as usize)) | b, new_size)
            }
            (Self::Symbolic { value: a, .. }, Self::Symbolic { value: b, .. }) => Self::from_z3(a.concat(b)),
            (Self::Concrete { value: a, size: a_size }, Self::Symbolic { value: b, .. }) => {
                let ctx = b.get_ctx();
                Self::from_z3(biguint_to_bv(ctx, a, *a_size).concat(b))
            }
            (Self::Symbolic { value: a, .. }, Self::Concrete { value: b, size: b_size }) => {
                let ctx = a.get_ctx();
                Self::from_z3(a.concat(&biguint_to_bv(ctx, b, *b_size)))
            }
        }
    }

    pub fn and(&self, other: &Self, ctx: &'ctx Context) -> Self {
        match (self, other) {
            (Self::Concrete { value: a, size }, Self::Concrete { value: b, .. }) => {
                Self::from_biguint(a & b, *size)
            }
            _ => Self::from_z3(self.as_z3(ctx).bvand(&other.as_z3(ctx))),
        }
    }

    pub fn or(&self, other: &Self, ctx: &'ctx Context) -> Self {
        match (self, other) {
            (Self::Concrete { value: a, size }, Self::Concrete { value: b, .. }) => {
                Self::from_biguint(a | b, *size)
            }
            _ => Self::from_z3(self.as_z3(ctx).bvor(&other.as_z3(ctx))),
        }
    }

    pub fn xor(&self, other: &Self, ctx: &'ctx Context) -> Self {
        match (self, other) {
            (Self::Concrete { value: a, size }, Self::Concrete { value: b, .. }) => {
                Self::from_biguint(a ^ b, *size)
            }
            _ => Self::from_z3(self.as_z3(ctx).bvxor(&other.as_z3(ctx))),
        }
    }

    pub fn eq(&self, other: &Self, ctx: &'ctx Context) -> SymBool<'ctx> {
        match (self, other) {
            (Self::Concrete { value: a, .. }, Self::Concrete { value: b, .. }) => SymBool::Concrete(a == b),
            _ => SymBool::from_z3(self.as_z3(ctx)._eq(&other.as_z3(ctx))),
        }
    }

    pub fn ult(&self, other: &Self, ctx: &'ctx Context) -> SymBool<'ctx> {
        match (self, other) {
            (Self::Concrete { value: a, .. }, Self::Concrete { value: b, .. }) => SymBool::Concrete(a < b),
            _ => SymBool::from_z3(self.as_z3(ctx).bvult(&other.as_z3(ctx))),
        }
    }

    pub fn ugt(&self, other: &Self, ctx: &'ctx Context) -> SymBool<'ctx> {
        match (self, other) {
            (Self::Concrete { value: a, .. }, Self::Concrete { value: b, .. }) => SymBool::Concrete(a > b),
            _ => SymBool::from_z3(self.as_z3(ctx).bvugt(&other.as_z3(ctx))),
        }
    }

    pub fn ule(&self, other: &Self, ctx: &'ctx Context) -> SymBool<'ctx> {
        match (self, other) {
            (Self::Concrete { value: a, .. }, Self::Concrete { value: b, .. }) => SymBool::Concrete(a <= b),
            _ => SymBool::from_z3(self.as_z3(ctx).bvule(&other.as_z3(ctx))),
        }
    }

    pub fn uge(&self, other: &Self, ctx: &'ctx Context) -> SymBool<'ctx> {
        match (self, other) {
            (Self::Concrete { value: a, .. }, Self::Concrete { value: b, .. }) => SymBool::Concrete(a >= b),
            _ => SymBool::from_z3(self.as_z3(ctx).bvuge(&other.as_z3(ctx))),
        }
    }

    pub fn slt(&self, other: &Self, ctx: &'ctx Context) -> SymBool<'ctx> {
        match (self, other) {
            (Self::Concrete { value: a, size }, Self::Concrete { value: b, .. }) => {
                SymBool::Concrete(to_signed_bigint(a, *size) < to_signed_bigint(b, *size))
            }
            _ => SymBool::from_z3(self.as_z3(ctx).bvslt(&other.as_z3(ctx))),
        }
    }

    pub fn sgt(&self, other: &Self, ctx: &'ctx Context) -> SymBool<'ctx> {
        match (self, other) {
            (Self::Concrete { value: a, size }, Self::Concrete { value: b, .. }) => {
                SymBool::Concrete(to_signed_bigint(a, *size) > to_signed_bigint(b, *size))
            }
            _ => SymBool::from_z3(self.as_z3(ctx).bvsgt(&other.as_z3(ctx))),
        }
    }

    pub fn not(&self, ctx: &'ctx Context) -> Self {
        match self {
            Self::Concrete { value, size } => Self::from_biguint(mask(*size) ^ value, *size),
            _ => Self::from_z3(self.as_z3(ctx).bvnot()),
        }
    }

    pub fn shl(&self, shift: &Self, ctx: &'ctx Context) -> Self {
        match (self, shift) {
            (Self::Concrete { value, size }, Self::Concrete { value: shift_amt, .. }) => {
                if let Some(shift_u32) = shift_amt.to_u32() {
                    if shift_u32 >= *size {
                        Self::from_u64(0, *size)
                    } else {
                        Self::from_biguint((value << shift_u32) & mask(*size), *size)
                    }
                } else {
                    Self::from_u64(0, *size)
                }
            }
            _ => Self::from_z3(self.as_z3(ctx).bvshl(&shift.as_z3(ctx))),
        }
    }

    pub fn shr(&self, shift: &Self, ctx: &'ctx Context) -> Self {
        self.lshr(shift, ctx)
    }

    pub fn lshr(&self, shift: &Self, ctx: &'ctx Context) -> Self {
        match (self, shift) {
            (Self::Concrete { value, size }, Self::Concrete { value: shift_amt, .. }) => {
                if let Some(shift_u32) = shift_amt.to_u32() {
                    if shift_u32 >= *size {
                        Self::from_u64(0, *size)
                    } else {
                        Self::from_biguint(value >> shift_u32, *size)
                    }
                } else {
                    Self::from_u64(0, *size)
                }
            }
            _ => Self::from_z3(self.as_z3(ctx).bvlshr(&shift.as_z3(ctx))),
        }
    }

    pub fn sar(&self, shift: &Self, ctx: &'ctx Context) -> Self {
        self.ashr(shift, ctx)
    }

    pub fn ashr(&self, shift: &Self, ctx: &'ctx Context) -> Self {
        match (self, shift) {
            (Self::Concrete { value, size }, Self::Concrete { value: shift_amt, .. }) => {
                let sign_bit = BigUint::one() << (size - 1);
                let is_negative = value >= &sign_bit;
                if let Some(shift_u32) = shift_amt.to_u32() {
                    if shift_u32 >= *size {
                        if is_negative {
                            Self::from_biguint(mask(*size), *size)
                        } else {
                            Self::from_u64(0, *size)
                        }
                    } else {
                        let shifted = value >> shift_u32;
                        if is_negative {
                            let fill_mask = ((BigUint::one() << shift_u32) - BigUint::one()) << (size - shift_u32);
                            Self::from_biguint(shifted | fill_mask, *size)
                        } else {
                            Self::from_biguint(shifted, *size)
                        }
                    }
                } else if is_negative {
                    Self::from_biguint(mask(*size), *size)
                } else {
                    Self::from_u64(0, *size)
                }
            }
            _ => Self::from_z3(self.as_z3(ctx).bvashr(&shift.as_z3(ctx))),
        }
    }

    pub fn from_u256(_ctx: &'ctx Context, bytes: &[u8]) -> Self {
        if bytes.len() < 32 {
            return Self::from_u64(0, 256);
        }
        Self::Concrete {
            value: BigUint::from_bytes_be(&bytes[0..32]),
            size: 256,
        }
    }

    /// Big-endian bytes. Symbolic values are zero-filled to match bit-width
    /// (callers needing the real value must go through the solver first).
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            Self::Concrete { value, size } => {
                let bytes = value.to_bytes_be();
                let target_len = (*size as usize + 7) / 8;
                if target_len == 0 {
                    return Vec::new();
                }
                if bytes.len() < target_len {
                    let mut result = vec![0u8; target_len];
                    result[target_len - bytes.len()..].copy_from_slice(&bytes);
                    result
                } else if bytes.len() > target_len {
                    bytes[bytes.len() - target_len..].to_vec()
                } else {
                    bytes
                }
            }
            Self::Symbolic { size, .. } => vec![0u8; (*size as usize + 7) / 8],
        }
    }

    pub fn to_concrete_bytes(&self) -> BvResult<Vec<u8>> {
        match self {
            Self::Concrete { .. } => Ok(self.to_bytes()),
            Self::Symbolic { .. } => {
                Err(NotConcreteError("cannot convert symbolic bit vector to bytes".to_string()))
            }
        }
    }

    pub fn size_bytes(&self) -> usize {
        (self.size() as usize + 7) / 8
    }

    /// Extract byte `idx` (0 = most significant), zero-padded into an
    /// `output_size`-bit result.
    pub fn byte(&self, idx: usize, ctx: &'ctx Context, output_size: u32) -> Self {
        let byte_len = self.size_bytes();
        if idx >= byte_len {
            return Self::from_u64(0, output_size);
        }
        match self {
            Self::Concrete { .. } => {
                let bytes = self.to_bytes();
                let mut result = Self::from_u64(bytes[idx] as u64, 8);
                if output_size > 8 {
                    result = result.zero_extend(output_size, ctx);
                } else if output_size < 8 {
                    result = result.truncate(output_size, ctx);
                }
                result
            }
            Self::Symbolic { .. } => {
                let effective_idx = byte_len - 1 - idx;
                let lo = (effective_idx * 8) as u32;
                let hi = lo + 7;
                let mut result = Self::from_z3(self.as_z3(ctx).extract(hi, lo));
                if output_size > 8 {
                    result = result.zero_extend(output_size, ctx);
                } else if output_size < 8 {
                    result = result.truncate(output_size, ctx);
                }
                result
            }
        }
    }

    /// Extract `size_bytes` bytes starting at byte offset `offset`,
    /// zero-padding past the end.
    pub fn extract_bytes(&self, offset: usize, size_bytes: usize, ctx: &'ctx Context) -> BvResult<Self> {
        if size_bytes == 0 {
            return Ok(Self::from_u64(0, 0));
        }

        let size_bits = (size_bytes * 8) as u32;
        let data_byte_len = self.size_bytes();

        if offset >= data_byte_len {
            return Ok(Self::from_u64(0, size_bits));
        }

        let available_bytes = data_byte_len - offset;

        if available_bytes >= size_bytes {
            match self {
                Self::Concrete { .. } => {
                    let bytes = self.to_bytes();
                    let mut value = BigUint::zero();
                    for &byte in &bytes[offset..offset + size_bytes] {
                        value = (value << 8) + BigUint::from(byte);
                    }
                    Ok(Self::Concrete { value, size: size_bits })
                }
                Self::Symbolic { .. } => {
                    let bit_len = self.size() as usize;
                    let start_bit = (data_byte_len - offset - size_bytes) * 8;
                    let end_bit = start_bit + (size_bytes * 8);
                    if end_bit > bit_len {
                        let available_bits = bit_len - start_bit;
                        let extracted = self.as_z3(ctx).extract((bit_len - start_bit - 1) as u32, 0);
                        let result = Self::from_z3(extracted);
                        Ok(result.zero_extend(size_bits, ctx))
                    } else {
                        Ok(Self::from_z3(self.as_z3(ctx).extract((end_bit - 1) as u32, start_bit as u32)))
                    }
                }
            }
        } else {
            let padding_bytes = size_bytes - available_bytes;
            let available = self.extract_bytes(offset, available_bytes, ctx)?;
            let padding = Self::from_u64(0, (padding_bytes * 8) as u32);
            match (&available, &padding) {
                (Self::Concrete { value: v1, .. }, Self::Concrete { .. }) => Ok(Self::Concrete {
                    value: v1 << (padding_bytes * 8),
                    size: size_bits,
                }),
                _ => Ok(Self::from_z3(available.as_z3(ctx).concat(&padding.as_z3(ctx)))),
            }
        }
    }
}

impl<'ctx> fmt::Debug for SymBitVec<'ctx> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Concrete { value, size } => write!(f, "BV({value}, {size})"),
            Self::Symbolic { value, size } => write!(f, "BV({value}, {size})"),
        }
    }
}
