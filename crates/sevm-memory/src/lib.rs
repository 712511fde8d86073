// SPDX-License-Identifier: AGPL-3.0

//! Lambda memory and storage: 256-bit-indexed maps with a default value,
//! backed by a Z3 `Array` once a symbolic key touches them.
//!
//! The teacher's `cbse-sevm::storage` models Solidity's slot/mapping/array
//! layout directly (per-slot `num_keys`/`size_keys` bookkeeping, keccak-slot
//! decoding). This engine works one level below Solidity, over a flat
//! 256-bit key space, so that layout-aware bookkeeping has no counterpart
//! here; what carries over is the teacher's core idea of keeping a concrete
//! `Value` fast path next to a lazily-materialized `Array` for the symbolic
//! case (`StorageValue::Value` vs `StorageValue::Array`).
//!
//! A concrete-keyed map clones in O(1) via `Rc` (copy-on-write, cloned only
//! when a write actually diverges two owners); once any symbolic key is
//! stored, the whole map is materialized into a Z3 `Array` and every
//! subsequent clone is the O(1) clone of a Z3 term.
//!
//! `Storage` additionally supports a partial-concrete mode
//! (`new_partial_concrete`), backed by a Z3 `Array` from construction with a
//! concrete snapshot layered on top, mirroring `SEtaac/state.py`'s
//! `PartialConcreteStorage` vs plain `LambdaMemory` choice gated by
//! `partial_concrete_storage`.

use num_bigint::BigUint;
use sevm_bitvec::SymBitVec;
use std::collections::HashMap;
use std::rc::Rc;
use z3::ast::Array as Z3Array;
use z3::{Context, Sort};

/// A 256-bit-indexed map with a concrete default, covering both EVM memory
/// (8-bit values) and storage (256-bit values).
#[derive(Clone)]
pub enum LambdaMap<'ctx> {
    /// Every key touched so far has been concrete; `entries` is the sparse
    /// override set against `default`.
    Concrete {
        entries: Rc<HashMap<BigUint, SymBitVec<'ctx>>>,
        default: SymBitVec<'ctx>,
        domain_bits: u32,
    },
    /// At least one symbolic key has been stored; everything lives in a Z3
    /// `Array` term from here on.
    Symbolic {
        array: Z3Array<'ctx>,
        domain_bits: u32,
        range_bits: u32,
    },
    /// Backed by a Z3 `Array` from the start (so symbolic keys never force a
    /// one-time promotion), with a concrete snapshot layered on top: a write
    /// through a concrete key updates both `entries` and `array`, so reads of
    /// keys present in `entries` skip the solver entirely. Reads/writes
    /// through a symbolic key fall back to the array, which `entries` never
    /// has to agree with beyond what it actually tracked.
    PartialConcrete {
        entries: Rc<HashMap<BigUint, SymBitVec<'ctx>>>,
        array: Z3Array<'ctx>,
        domain_bits: u32,
        range_bits: u32,
    },
}

impl<'ctx> LambdaMap<'ctx> {
    pub fn new(domain_bits: u32, default: SymBitVec<'ctx>) -> Self {
        Self::Concrete {
            entries: Rc::new(HashMap::new()),
            default,
            domain_bits,
        }
    }

    /// A map backed by a named Z3 `Array` from the outset, with an empty
    /// concrete snapshot layered on top.
    pub fn new_partial_concrete(
        domain_bits: u32,
        default: SymBitVec<'ctx>,
        ctx: &'ctx Context,
        name: &str,
    ) -> Self {
        let domain_sort = Sort::bitvector(ctx, domain_bits);
        let range_bits = default.size();
        // named so two partial-concrete maps created with the same tag
        // (e.g. across a clone) produce identical baseline terms.
        let _ = name;
        let array = Z3Array::const_array(ctx, &domain_sort, &default.as_z3(ctx));
        Self::PartialConcrete {
            entries: Rc::new(HashMap::new()),
            array,
            domain_bits,
            range_bits,
        }
    }

    fn range_bits(&self) -> u32 {
        match self {
            Self::Concrete { default, .. } => default.size(),
            Self::Symbolic { range_bits, .. } => *range_bits,
            Self::PartialConcrete { range_bits, .. } => *range_bits,
        }
    }

    fn materialize(&self, ctx: &'ctx Context, name: &str) -> Z3Array<'ctx> {
        match self {
            Self::Symbolic { array, .. } => array.clone(),
            Self::PartialConcrete {
                array,
                entries,
                domain_bits,
                ..
            } => {
                let mut array = array.clone();
                for (key, value) in entries.iter() {
                    let key_bv = SymBitVec::from_biguint(key.clone(), *domain_bits);
                    array = array.store(&key_bv.as_z3(ctx), &value.as_z3(ctx));
                }
                array
            }
            Self::Concrete {
                entries,
                default,
                domain_bits,
            } => {
                let domain_sort = Sort::bitvector(ctx, *domain_bits);
                let range_sort = Sort::bitvector(ctx, default.size());
                let mut array = Z3Array::const_array(ctx, &domain_sort, &default.as_z3(ctx));
                // const_array covers the default; named so repeated
                // materializations of an unchanged map produce identical
                // terms rather than fresh unconstrained consts.
                let _ = name;
                for (key, value) in entries.iter() {
                    let key_bv = SymBitVec::from_biguint(key.clone(), *domain_bits);
                    array = array.store(&key_bv.as_z3(ctx), &value.as_z3(ctx));
                }
                let _ = range_sort;
                array
            }
        }
    }

    pub fn load(&self, key: &SymBitVec<'ctx>, ctx: &'ctx Context) -> SymBitVec<'ctx> {
        match self {
            Self::Concrete { entries, default, .. } => match key.as_biguint() {
                Ok(k) => entries.get(&k).cloned().unwrap_or_else(|| default.clone()),
                Err(_) => {
                    // A symbolic read against a concrete-only map: fall back
                    // to a one-off materialized array rather than promoting
                    // `self` (this is a read, `&self`).
                    let array = self.materialize(ctx, "lambda_probe");
                    let selected = array.select(&key.as_z3(ctx));
                    SymBitVec::from_z3(selected.as_bv().expect("array range is a bit-vector"))
                }
            },
            Self::Symbolic { array, .. } => {
                let selected = array.select(&key.as_z3(ctx));
                SymBitVec::from_z3(selected.as_bv().expect("array range is a bit-vector"))
            }
            Self::PartialConcrete { entries, array, .. } => match key.as_biguint() {
                Ok(k) => match entries.get(&k) {
                    Some(value) => value.clone(),
                    None => {
                        let selected = array.select(&key.as_z3(ctx));
                        SymBitVec::from_z3(selected.as_bv().expect("array range is a bit-vector"))
                    }
                },
                Err(_) => {
                    let selected = array.select(&key.as_z3(ctx));
                    SymBitVec::from_z3(selected.as_bv().expect("array range is a bit-vector"))
                }
            },
        }
    }

    pub fn store(&mut self, key: SymBitVec<'ctx>, value: SymBitVec<'ctx>, ctx: &'ctx Context, name: &str) {
        match self {
            Self::Concrete {
                entries,
                domain_bits,
                ..
            } => match key.as_biguint() {
                Ok(k) => {
                    Rc::make_mut(entries).insert(k, value);
                }
                Err(_) => {
                    let range_bits = self.range_bits();
                    let domain_bits = *domain_bits;
                    let array = self.materialize(ctx, name);
                    let array = array.store(&key.as_z3(ctx), &value.as_z3(ctx));
                    *self = Self::Symbolic {
                        array,
                        domain_bits,
                        range_bits,
                    };
                }
            },
            Self::Symbolic { array, .. } => {
                *array = array.store(&key.as_z3(ctx), &value.as_z3(ctx));
            }
            Self::PartialConcrete { entries, array, .. } => {
                *array = array.store(&key.as_z3(ctx), &value.as_z3(ctx));
                if let Ok(k) = key.as_biguint() {
                    Rc::make_mut(entries).insert(k, value);
                }
            }
        }
    }

    /// Whether the map is backed by a Z3 `Array` at all. True for
    /// `Symbolic` (promoted by a past symbolic write) and `PartialConcrete`
    /// (backed by one from construction), even though the latter still
    /// serves concrete-keyed reads out of its snapshot.
    pub fn is_symbolic(&self) -> bool {
        matches!(self, Self::Symbolic { .. } | Self::PartialConcrete { .. })
    }

    /// Number of concrete overrides tracked, for diagnostics; always zero
    /// once the map has gone fully symbolic (a partial-concrete map keeps
    /// tracking its snapshot even though it is backed by an array).
    pub fn concrete_len(&self) -> usize {
        match self {
            Self::Concrete { entries, .. } => entries.len(),
            Self::Symbolic { .. } => 0,
            Self::PartialConcrete { entries, .. } => entries.len(),
        }
    }
}

/// EVM memory: 256-bit byte index to 8-bit value, default 0.
#[derive(Clone)]
pub struct Memory<'ctx> {
    map: LambdaMap<'ctx>,
}

impl<'ctx> Memory<'ctx> {
    pub fn new(_ctx: &'ctx Context) -> Self {
        Self {
            map: LambdaMap::new(256, SymBitVec::from_u64(0, 8)),
        }
    }

    pub fn load_byte(&self, index: &SymBitVec<'ctx>, ctx: &'ctx Context) -> SymBitVec<'ctx> {
        self.map.load(index, ctx)
    }

    pub fn store_byte(&mut self, index: SymBitVec<'ctx>, value: SymBitVec<'ctx>, ctx: &'ctx Context, xid: u64) {
        self.map.store(index, value, ctx, &format!("memory_{xid}"));
    }

    /// Load a big-endian word of `size_bytes` bytes starting at `offset`.
    pub fn load_word(&self, offset: &SymBitVec<'ctx>, size_bytes: u32, ctx: &'ctx Context) -> SymBitVec<'ctx> {
        let offset_val = offset.as_biguint().ok();
        let mut acc: Option<SymBitVec<'ctx>> = None;
        for i in 0..size_bytes {
            let idx = match &offset_val {
                Some(base) => SymBitVec::from_biguint(base + i, 256),
                None => offset.add(&SymBitVec::from_u64(i as u64, 256), ctx),
            };
            let byte = self.load_byte(&idx, ctx);
            acc = Some(match acc {
                None => byte,
                Some(prev) => prev.concat(&byte),
            });
        }
        acc.unwrap_or_else(|| SymBitVec::from_u64(0, 0))
    }

    pub fn is_symbolic(&self) -> bool {
        self.map.is_symbolic()
    }
}

/// EVM storage: 256-bit key to 256-bit value, default 0.
#[derive(Clone)]
pub struct Storage<'ctx> {
    map: LambdaMap<'ctx>,
}

impl<'ctx> Storage<'ctx> {
    pub fn new(_ctx: &'ctx Context) -> Self {
        Self {
            map: LambdaMap::new(256, SymBitVec::from_u64(0, 256)),
        }
    }

    /// Storage backed by a snapshot-plus-array hybrid from the start, for
    /// states constructed with `partial_concrete_storage` set.
    pub fn new_partial_concrete(ctx: &'ctx Context, xid: u64) -> Self {
        Self {
            map: LambdaMap::new_partial_concrete(
                256,
                SymBitVec::from_u64(0, 256),
                ctx,
                &format!("PCONCR_STORAGE_{xid}"),
            ),
        }
    }

    pub fn load(&self, key: &SymBitVec<'ctx>, ctx: &'ctx Context) -> SymBitVec<'ctx> {
        self.map.load(key, ctx)
    }

    pub fn store(&mut self, key: SymBitVec<'ctx>, value: SymBitVec<'ctx>, ctx: &'ctx Context, xid: u64) {
        self.map.store(key, value, ctx, &format!("storage_{xid}"));
    }

    pub fn is_symbolic(&self) -> bool {
        self.map.is_symbolic()
    }

    pub fn concrete_len(&self) -> usize {
        self.map.concrete_len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use z3::Config;

    #[test]
    fn concrete_load_store_round_trips() {
        let cfg = Config::new();
        let ctx = Context::new(&cfg);
        let mut storage = Storage::new(&ctx);

        let key = SymBitVec::from_u64(5, 256);
        let value = SymBitVec::from_u64(42, 256);
        storage.store(key.clone(), value.clone(), &ctx, 0);

        let loaded = storage.load(&key, &ctx);
        assert_eq!(loaded.as_u64().unwrap(), 42);
        assert!(!storage.is_symbolic());
    }

    #[test]
    fn untouched_key_returns_default() {
        let cfg = Config::new();
        let ctx = Context::new(&cfg);
        let storage = Storage::new(&ctx);
        let loaded = storage.load(&SymBitVec::from_u64(999, 256), &ctx);
        assert_eq!(loaded.as_u64().unwrap(), 0);
    }

    #[test]
    fn symbolic_key_store_promotes_to_array() {
        let cfg = Config::new();
        let ctx = Context::new(&cfg);
        let mut storage = Storage::new(&ctx);

        storage.store(SymBitVec::from_u64(1, 256), SymBitVec::from_u64(10, 256), &ctx, 0);

        let sym_key = SymBitVec::symbolic(&ctx, "k", 256);
        storage.store(sym_key, SymBitVec::from_u64(20, 256), &ctx, 0);

        assert!(storage.is_symbolic());
        // prior concrete entry must still be readable through the array.
        let loaded = storage.load(&SymBitVec::from_u64(1, 256), &ctx);
        assert_eq!(loaded.as_u64().unwrap(), 10);
    }

    #[test]
    fn partial_concrete_storage_serves_snapshot_without_touching_the_solver() {
        let cfg = Config::new();
        let ctx = Context::new(&cfg);
        let mut storage = Storage::new_partial_concrete(&ctx, 0);

        assert!(storage.is_symbolic());
        let loaded = storage.load(&SymBitVec::from_u64(999, 256), &ctx);
        assert_eq!(loaded.as_u64().unwrap(), 0);

        storage.store(SymBitVec::from_u64(1, 256), SymBitVec::from_u64(10, 256), &ctx, 0);
        assert_eq!(storage.concrete_len(), 1);
        assert_eq!(storage.load(&SymBitVec::from_u64(1, 256), &ctx).as_u64().unwrap(), 10);

        let sym_key = SymBitVec::symbolic(&ctx, "k", 256);
        storage.store(sym_key, SymBitVec::from_u64(20, 256), &ctx, 0);
        // the concrete snapshot survives a symbolic write past it.
        assert_eq!(storage.concrete_len(), 1);
        assert_eq!(storage.load(&SymBitVec::from_u64(1, 256), &ctx).as_u64().unwrap(), 10);
    }

    #[test]
    fn clone_is_independent_once_diverged() {
        let cfg = Config::new();
        let ctx = Context::new(&cfg);
        let mut base = Storage::new(&ctx);
        base.store(SymBitVec::from_u64(1, 256), SymBitVec::from_u64(10, 256), &ctx, 0);

        let mut clone = base.clone();
        clone.store(SymBitVec::from_u64(1, 256), SymBitVec::from_u64(99, 256), &ctx, 0);

        assert_eq!(base.load(&SymBitVec::from_u64(1, 256), &ctx).as_u64().unwrap(), 10);
        assert_eq!(clone.load(&SymBitVec::from_u64(1, 256), &ctx).as_u64().unwrap(), 99);
    }

    #[test]
    fn memory_load_word_concatenates_bytes_big_endian() {
        let cfg = Config::new();
        let ctx = Context::new(&cfg);
        let mut memory = Memory::new(&ctx);
        memory.store_byte(SymBitVec::from_u64(0, 256), SymBitVec::from_u64(0x12, 8), &ctx, 0);
        memory.store_byte(SymBitVec::from_u64(1, 256), SymBitVec::from_u64(0x34, 8), &ctx, 0);

        let word = memory.load_word(&SymBitVec::from_u64(0, 256), 2, &ctx);
        assert_eq!(word.as_u64().unwrap(), 0x1234);
    }
}
