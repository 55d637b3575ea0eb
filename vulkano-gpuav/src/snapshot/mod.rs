//! Copies of the bound descriptor state, in the form that instrumented shaders read.
//!
//! At every draw or dispatch, the state of the descriptor sets that the pipeline can see is
//! captured in a [`BindingSnapshot`], and encoded into the [`SnapshotArena`] of the command
//! buffer. The instrumented shaders of the command are given the offset of the encoded region,
//! and use [`lookup`] to find the state of the descriptor that they are about to access.
//!
//! # Encoding
//!
//! A region is a flat array of `u32` words. All offsets are relative to the start of the
//! region, and an offset of `0` means that the item is absent.
//!
//! ```text
//! header:   [set_count, flags, set_offset[set_count]]
//! set:      [status, binding_count, (binding, binding_offset)[binding_count]]
//! binding:  [element_count, binding_flags, states[(element_count + 15) / 16]]
//! ```
//!
//! - Bit 0 of `flags` is set if the `null_descriptor` feature is enabled.
//! - `status` is `0` for a set that was never bound, `1` for a bound set, and `2` for a set that
//!   was disturbed by an incompatible bind. Only bound sets have bindings.
//! - The `(binding, binding_offset)` pairs are sorted by binding number, and only cover the
//!   bindings that were captured. Sparse binding numbers cost nothing.
//! - The state of each element is a 2-bit [`DescriptorValidity`] code, 16 elements per word,
//!   starting at the least significant bits.

pub use self::arena::SnapshotArena;
use crate::descriptor_set::{layout::DescriptorBindingFlags, DescriptorSet, DescriptorValidity};
use std::{cmp::Ordering, collections::BTreeMap, num::NonZero};

mod arena;

/// Bit of the header flags that is set if null descriptors may be accessed.
pub const FLAG_NULL_DESCRIPTOR: u32 = 1;

const STATUS_UNBOUND: u32 = 0;
const STATUS_BOUND: u32 = 1;
const STATUS_DISTURBED: u32 = 2;

const STATES_PER_WORD: u32 = 16;

/// The descriptor state that a single draw or dispatch can see, indexed by set number.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BindingSnapshot {
    /// Whether the `null_descriptor` feature is enabled.
    pub null_descriptor: bool,

    pub sets: Vec<SetSnapshot>,
}

/// The state of one set number in a [`BindingSnapshot`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SetSnapshot {
    /// No descriptor set was ever bound at this number.
    Unbound,

    /// A descriptor set was bound, but was then disturbed by binding a descriptor set with an
    /// incompatible pipeline layout.
    Disturbed,

    /// A descriptor set is bound.
    Bound(BoundSetSnapshot),
}

/// The captured state of a bound descriptor set.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BoundSetSnapshot {
    /// The id of the descriptor set.
    pub descriptor_set: NonZero<u64>,

    /// The captured bindings, by binding number.
    pub bindings: BTreeMap<u32, BindingStateSnapshot>,
}

/// The captured state of a single binding.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BindingStateSnapshot {
    pub binding_flags: DescriptorBindingFlags,
    pub elements: Vec<DescriptorValidity>,
}

impl BoundSetSnapshot {
    /// Captures the current state of `bindings` of `descriptor_set`. Binding numbers that the
    /// layout of the set does not have are ignored.
    pub fn capture(
        descriptor_set: &DescriptorSet,
        bindings: impl IntoIterator<Item = u32>,
    ) -> Self {
        let layout = descriptor_set.layout();
        let resources = descriptor_set.resources();

        let bindings = bindings
            .into_iter()
            .filter_map(|binding| {
                let layout_binding = layout.binding(binding)?;
                let binding_resources = resources.binding(binding)?;

                Some((
                    binding,
                    BindingStateSnapshot {
                        binding_flags: layout_binding.binding_flags,
                        elements: binding_resources.validity().to_vec(),
                    },
                ))
            })
            .collect();

        BoundSetSnapshot {
            descriptor_set: descriptor_set.id(),
            bindings,
        }
    }

    /// Returns a snapshot of a descriptor set that is no longer alive. Every element of the
    /// given bindings is [`DescriptorValidity::Destroyed`].
    pub fn destroyed(
        descriptor_set: NonZero<u64>,
        bindings: impl IntoIterator<Item = (u32, DescriptorBindingFlags, u32)>,
    ) -> Self {
        let bindings = bindings
            .into_iter()
            .map(|(binding, binding_flags, element_count)| {
                (
                    binding,
                    BindingStateSnapshot {
                        binding_flags,
                        elements: vec![DescriptorValidity::Destroyed; element_count as usize],
                    },
                )
            })
            .collect();

        BoundSetSnapshot {
            descriptor_set,
            bindings,
        }
    }
}

impl BindingSnapshot {
    /// Returns the number of words that the encoded snapshot takes up.
    pub fn encoded_len(&self) -> usize {
        2 + self.sets.len()
            + self
                .sets
                .iter()
                .map(|set| match set {
                    SetSnapshot::Unbound | SetSnapshot::Disturbed => 2,
                    SetSnapshot::Bound(bound) => {
                        2 + 2 * bound.bindings.len()
                            + bound
                                .bindings
                                .values()
                                .map(|state| binding_len(state.elements.len()))
                                .sum::<usize>()
                    }
                })
                .sum::<usize>()
    }

    /// Encodes the snapshot into a new region of `arena`, and returns the offset of the region.
    pub fn encode(&self, arena: &mut SnapshotArena) -> u32 {
        let len = self.encoded_len();
        let region = arena.alloc(len);
        let words = &mut arena.words_mut()[region as usize..][..len];

        words[0] = self.sets.len() as u32;
        words[1] = if self.null_descriptor {
            FLAG_NULL_DESCRIPTOR
        } else {
            0
        };

        let mut cursor = 2 + self.sets.len();

        for (set_num, set) in self.sets.iter().enumerate() {
            words[2 + set_num] = cursor as u32;
            let set_start = cursor;

            match set {
                SetSnapshot::Unbound => {
                    words[set_start] = STATUS_UNBOUND;
                    cursor += 2;
                }
                SetSnapshot::Disturbed => {
                    words[set_start] = STATUS_DISTURBED;
                    cursor += 2;
                }
                SetSnapshot::Bound(bound) => {
                    words[set_start] = STATUS_BOUND;
                    words[set_start + 1] = bound.bindings.len() as u32;
                    cursor += 2 + 2 * bound.bindings.len();

                    for (index, (&binding, state)) in bound.bindings.iter().enumerate() {
                        words[set_start + 2 + 2 * index] = binding;
                        words[set_start + 3 + 2 * index] = cursor as u32;
                        words[cursor] = state.elements.len() as u32;
                        words[cursor + 1] = state.binding_flags.as_raw();
                        pack_states(&mut words[cursor + 2..], &state.elements);
                        cursor += binding_len(state.elements.len());
                    }
                }
            }
        }

        debug_assert_eq!(cursor, len);

        region
    }
}

fn binding_len(element_count: usize) -> usize {
    2 + element_count.div_ceil(STATES_PER_WORD as usize)
}

fn pack_states(words: &mut [u32], elements: &[DescriptorValidity]) {
    for (word, chunk) in words
        .iter_mut()
        .zip(elements.chunks(STATES_PER_WORD as usize))
    {
        *word = chunk
            .iter()
            .enumerate()
            .fold(0, |acc, (i, validity)| acc | validity.code() << (i * 2));
    }
}

/// The result of looking up a descriptor in an encoded snapshot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SnapshotLookup {
    /// The set number is not in the pipeline layout, or nothing was ever bound at it.
    SetUnbound,

    /// The set was disturbed by an incompatible bind.
    SetDisturbed,

    /// The bound set has no such binding, or the binding was not captured.
    BindingAbsent,

    /// The element is not less than the number of elements of the binding.
    OutOfBounds { element_count: u32 },

    /// The state of the element.
    Element(DescriptorValidity),
}

/// Looks up the state of `element` of `(set, binding)` in the region at `region` of `words`.
///
/// This is the routine that instrumented shaders run before each access. It never panics:
/// reads past the end of `words` are treated as absent.
pub fn lookup(words: &[u32], region: u32, set: u32, binding: u32, element: u32) -> SnapshotLookup {
    let Some(set_start) = set_offset(words, region, set) else {
        return SnapshotLookup::SetUnbound;
    };

    match read(words, set_start) {
        STATUS_BOUND => (),
        STATUS_DISTURBED => return SnapshotLookup::SetDisturbed,
        _ => return SnapshotLookup::SetUnbound,
    }

    let Some(binding_start) = binding_offset(words, region, set_start, binding) else {
        return SnapshotLookup::BindingAbsent;
    };

    let element_count = read(words, binding_start);

    if element >= element_count {
        return SnapshotLookup::OutOfBounds { element_count };
    }

    let word = read(
        words,
        binding_start + 2 + (element / STATES_PER_WORD) as usize,
    );
    let shift = (element % STATES_PER_WORD) * 2;

    SnapshotLookup::Element(DescriptorValidity::from_code(word >> shift))
}

/// Returns whether the snapshot in the region at `region` allows null descriptors.
#[inline]
pub fn null_descriptor_enabled(words: &[u32], region: u32) -> bool {
    read(words, region as usize + 1) & FLAG_NULL_DESCRIPTOR != 0
}

/// Returns the encoded element states of `(set, binding)`, or `None` if the region does not
/// contain the binding.
pub fn binding_states(
    words: &[u32],
    region: u32,
    set: u32,
    binding: u32,
) -> Option<Vec<DescriptorValidity>> {
    let set_start = set_offset(words, region, set)?;

    if read(words, set_start) != STATUS_BOUND {
        return None;
    }

    let binding_start = binding_offset(words, region, set_start, binding)?;
    let element_count = read(words, binding_start);

    Some(
        (0..element_count)
            .map(|element| {
                let word = read(
                    words,
                    binding_start + 2 + (element / STATES_PER_WORD) as usize,
                );

                DescriptorValidity::from_code(word >> ((element % STATES_PER_WORD) * 2))
            })
            .collect(),
    )
}

/// Overwrites the element states of `(set, binding)` in an encoded region, leaving the rest of
/// the region untouched.
///
/// Returns `false` if the region does not contain the binding, or if the number of elements
/// differs from the encoded one.
pub fn refresh_binding(
    words: &mut [u32],
    region: u32,
    set: u32,
    binding: u32,
    elements: &[DescriptorValidity],
) -> bool {
    let Some(set_start) = set_offset(words, region, set) else {
        return false;
    };

    if read(words, set_start) != STATUS_BOUND {
        return false;
    }

    let Some(binding_start) = binding_offset(words, region, set_start, binding) else {
        return false;
    };

    if read(words, binding_start) as usize != elements.len() {
        return false;
    }

    let states_start = binding_start + 2;
    let states_len = elements.len().div_ceil(STATES_PER_WORD as usize);

    match words.get_mut(states_start..states_start + states_len) {
        Some(states) => {
            pack_states(states, elements);
            true
        }
        None => false,
    }
}

fn read(words: &[u32], index: usize) -> u32 {
    words.get(index).copied().unwrap_or(0)
}

fn set_offset(words: &[u32], region: u32, set: u32) -> Option<usize> {
    let region = region as usize;

    if set >= read(words, region) {
        return None;
    }

    match read(words, region + 2 + set as usize) {
        0 => None,
        offset => Some(region + offset as usize),
    }
}

fn binding_offset(words: &[u32], region: u32, set_start: usize, binding: u32) -> Option<usize> {
    let entries = set_start + 2;
    let (mut low, mut high) = (0, read(words, set_start + 1) as usize);

    // Binary search over the sorted `(binding, binding_offset)` pairs.
    while low < high {
        let mid = low + (high - low) / 2;

        match read(words, entries + 2 * mid).cmp(&binding) {
            Ordering::Less => low = mid + 1,
            Ordering::Greater => high = mid,
            Ordering::Equal => {
                return match read(words, entries + 2 * mid + 1) {
                    0 => None,
                    offset => Some(region as usize + offset as usize),
                };
            }
        }
    }

    None
}
