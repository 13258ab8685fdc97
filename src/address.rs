//! Synthetic guest-visible addresses.
//!
//! Every pointer exchanged with a guest module is a 64-bit integer whose
//! high 16 bits select a block in the [`crate::call_context::CallContext`]'s
//! block table and whose low 48 bits are a byte offset within that block.
//! `index_to_address`, `address_to_index`, and `mask_address` are the only
//! permitted conversions between the two representations; nothing else in
//! this crate should shift or mask a raw `u64` address by hand.

/// Index 0 is the permanently reserved "null page"; a zero address always
/// means "no block".
pub const NULL_INDEX: u16 = 0;

const INDEX_SHIFT: u32 = 48;
const OFFSET_MASK: u64 = (1u64 << INDEX_SHIFT) - 1;

/// Builds a synthetic address from a block index and an in-block offset.
///
/// `offset` is truncated to 48 bits, matching the "practical sizes never
/// approach 256 TiB" assumption in the design notes.
pub fn index_to_address(index: u16, offset: u64) -> u64 {
    ((index as u64) << INDEX_SHIFT) | (offset & OFFSET_MASK)
}

/// Extracts the block table index from a synthetic address.
pub fn address_to_index(address: u64) -> u16 {
    (address >> INDEX_SHIFT) as u16
}

/// Extracts the in-block byte offset from a synthetic address.
pub fn mask_address(address: u64) -> u64 {
    address & OFFSET_MASK
}

/// `true` iff this address encodes the reserved null index.
pub fn is_null(address: u64) -> bool {
    address_to_index(address) == NULL_INDEX
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_index_and_offset() {
        for index in [0u16, 1, 2, 0xFFFE, 0xFFFF] {
            for offset in [0u64, 1, 42, OFFSET_MASK / 2, OFFSET_MASK] {
                let addr = index_to_address(index, offset);
                assert_eq!(address_to_index(addr), index);
                assert_eq!(mask_address(addr), offset);
            }
        }
    }

    #[test]
    fn index_zero_is_null() {
        assert!(is_null(index_to_address(0, 0)));
        assert!(is_null(index_to_address(0, 1234)));
        assert!(!is_null(index_to_address(1, 0)));
    }

    #[test]
    fn offset_is_truncated_not_corrupted_across_indices() {
        let a = index_to_address(3, OFFSET_MASK);
        let b = index_to_address(4, 0);
        assert_ne!(address_to_index(a), address_to_index(b));
        assert_eq!(mask_address(a), OFFSET_MASK);
        assert_eq!(mask_address(b), 0);
    }
}
