// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Shuffle-sharding queue selection.
//!
//! A [`Dealer`] maps a flow's 64-bit hash to a small deterministic "hand"
//! of candidate queue indices: a draw of `hand_size` distinct cards from a
//! deck of `deck_size`, without replacement. Two flows rarely share a whole
//! hand, which bounds how badly one noisy flow can crowd out another while
//! keeping each flow pinned to the same few queues.
//!
//! The dealer is pure: it holds no queue state and can be validated and
//! tested on its own.

/// Number of hash bits the dealer may consume. A hand that needs more
/// entropy than this would reuse bits and skew the draw.
pub const MAX_HASH_BITS: u32 = 60;

// Given the entropy bound above, a feasible hand never exceeds 15 cards:
// hand_size 16 would need ceil(log2(deck)) <= 3, i.e. a deck of at most 8,
// and the hand cannot exceed the deck.
const MAX_HAND_SIZE: usize = 15;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ShuffleShardingError {
    #[error("deck size {0} is not positive")]
    NonPositiveDeckSize(usize),

    #[error("hand size {0} is not positive")]
    NonPositiveHandSize(usize),

    #[error("hand size {hand_size} is greater than deck size {deck_size}")]
    HandExceedsDeck { deck_size: usize, hand_size: usize },

    #[error(
        "a hand of {hand_size} from a deck of {deck_size} requires {required} bits of entropy, more than the {MAX_HASH_BITS} available"
    )]
    NotEnoughEntropy {
        deck_size: usize,
        hand_size: usize,
        required: u32,
    },
}

/// Bits of entropy a `(deck_size, hand_size)` draw consumes.
pub fn required_entropy_bits(deck_size: usize, hand_size: usize) -> u32 {
    ((deck_size as f64).log2() * hand_size as f64).ceil() as u32
}

/// Deals hands for one fixed `(deck_size, hand_size)` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dealer {
    deck_size: usize,
    hand_size: usize,
}

impl Dealer {
    pub fn new(deck_size: usize, hand_size: usize) -> Result<Self, ShuffleShardingError> {
        if deck_size == 0 {
            return Err(ShuffleShardingError::NonPositiveDeckSize(deck_size));
        }
        if hand_size == 0 {
            return Err(ShuffleShardingError::NonPositiveHandSize(hand_size));
        }
        if hand_size > deck_size {
            return Err(ShuffleShardingError::HandExceedsDeck {
                deck_size,
                hand_size,
            });
        }
        let required = required_entropy_bits(deck_size, hand_size);
        if required > MAX_HASH_BITS {
            return Err(ShuffleShardingError::NotEnoughEntropy {
                deck_size,
                hand_size,
                required,
            });
        }
        Ok(Self {
            deck_size,
            hand_size,
        })
    }

    pub fn deck_size(&self) -> usize {
        self.deck_size
    }

    pub fn hand_size(&self) -> usize {
        self.hand_size
    }

    /// Deal the hand for `hash_value`, invoking `pick` once per card.
    ///
    /// Cards are drawn without replacement: successive divisions by the
    /// shrinking deck size yield remainders, and each remainder is then
    /// shifted past the cards already drawn so all picks are distinct.
    pub fn deal(&self, hash_value: u64, mut pick: impl FnMut(usize)) {
        let mut hash = hash_value;
        let mut remainders = [0usize; MAX_HAND_SIZE];
        for (i, remainder) in remainders.iter_mut().take(self.hand_size).enumerate() {
            let deck_left = (self.deck_size - i) as u64;
            let next = hash / deck_left;
            *remainder = (hash - next * deck_left) as usize;
            hash = next;
        }
        for i in 0..self.hand_size {
            let mut card = remainders[i];
            for j in (1..=i).rev() {
                if card >= remainders[j - 1] {
                    card += 1;
                }
            }
            pick(card);
        }
    }

    /// The hand for `hash_value` as a vector, in deal order.
    pub fn deal_into_hand(&self, hash_value: u64) -> Vec<usize> {
        let mut hand = Vec::with_capacity(self.hand_size);
        self.deal(hash_value, |card| hand.push(card));
        hand
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_rejects_empty_deck_and_hand() {
        assert_eq!(
            Dealer::new(0, 1),
            Err(ShuffleShardingError::NonPositiveDeckSize(0))
        );
        assert_eq!(
            Dealer::new(8, 0),
            Err(ShuffleShardingError::NonPositiveHandSize(0))
        );
    }

    #[test]
    fn test_rejects_hand_larger_than_deck() {
        assert_eq!(
            Dealer::new(4, 5),
            Err(ShuffleShardingError::HandExceedsDeck {
                deck_size: 4,
                hand_size: 5
            })
        );
    }

    #[test]
    fn test_rejects_entropy_overflow() {
        // 512 cards need 9 bits each; 7 draws want 63 bits, over the 60 cap.
        assert!(matches!(
            Dealer::new(512, 7),
            Err(ShuffleShardingError::NotEnoughEntropy { required: 63, .. })
        ));
        // 256 cards at 8 bits each stay within budget.
        assert!(Dealer::new(256, 7).is_ok());
    }

    #[test]
    fn test_known_hand() {
        // deck 4, hand 2, hash 5: remainders are [1, 1]; the second card
        // shifts past the first, giving [1, 2].
        let dealer = Dealer::new(4, 2).unwrap();
        assert_eq!(dealer.deal_into_hand(5), vec![1, 2]);
    }

    #[test]
    fn test_hands_are_distinct_and_in_range() {
        let dealer = Dealer::new(16, 6).unwrap();
        for hash in 0..10_000u64 {
            let hand = dealer.deal_into_hand(hash.wrapping_mul(0x9e37_79b9_7f4a_7c15));
            assert_eq!(hand.len(), 6);
            let unique: HashSet<_> = hand.iter().copied().collect();
            assert_eq!(unique.len(), 6, "hand {hand:?} for hash {hash} repeats a card");
            assert!(hand.iter().all(|&card| card < 16));
        }
    }

    #[test]
    fn test_deal_is_deterministic() {
        let dealer = Dealer::new(64, 6).unwrap();
        assert_eq!(
            dealer.deal_into_hand(0xdead_beef),
            dealer.deal_into_hand(0xdead_beef)
        );
    }

    #[test]
    fn test_full_deck_hand_is_a_permutation() {
        let dealer = Dealer::new(8, 8).unwrap();
        let mut hand = dealer.deal_into_hand(123_456_789);
        hand.sort_unstable();
        assert_eq!(hand, (0..8).collect::<Vec<_>>());
    }
}
