//! Masking configuration parameters.
//!
//! See the [mask module] documentation since this is a private module anyways.
//!
//! [mask module]: crate::mask

use num::{
    bigint::{BigInt, BigUint},
    rational::Ratio,
    traits::One,
};
use serde::{Deserialize, Serialize};

/// Number of preserved decimal places of the fixed-point encoding.
pub const DECIMAL_PLACES: u32 = 10;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
/// The order of the finite group.
pub enum GroupType {
    /// A finite group of exact integer order.
    Integer,
    /// A finite group of power-of-two order.
    Power2,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
/// The bounds of the numbers to be masked.
pub enum BoundType {
    /// Numbers absolutely bounded by 1.
    B0 = 0,
    /// Numbers absolutely bounded by 100.
    B2 = 2,
    /// Numbers absolutely bounded by 10_000.
    B4 = 4,
    /// Numbers absolutely bounded by 1_000_000.
    B6 = 6,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
/// The number of contributions to be aggregated at most.
pub enum ModelType {
    /// At most 1_000 contributions to be aggregated.
    M3 = 3,
    /// At most 1_000_000 contributions to be aggregated.
    M6 = 6,
    /// At most 1_000_000_000 contributions to be aggregated.
    M9 = 9,
    /// At most 1_000_000_000_000 contributions to be aggregated.
    M12 = 12,
}

impl ModelType {
    /// Gets the maximum number of contributions that can be aggregated for this model type.
    pub fn max_nb_contributions(&self) -> u64 {
        10_u64.pow(*self as u8 as u32)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
/// A masking configuration.
///
/// The configuration is shared by all participants of a federation and by the coordinator, since
/// an aggregate can only be formed from contributions embedded in the same group.
pub struct MaskConfig {
    pub group_type: GroupType,
    pub bound_type: BoundType,
    pub model_type: ModelType,
}

impl Default for MaskConfig {
    fn default() -> Self {
        Self {
            group_type: GroupType::Integer,
            bound_type: BoundType::B2,
            model_type: ModelType::M3,
        }
    }
}

impl MaskConfig {
    /// Gets the absolute bound of the numbers to be masked.
    pub fn bound(&self) -> u64 {
        10_u64.pow(self.bound_type as u8 as u32)
    }

    /// Gets the maximum number of contributions that can be aggregated.
    pub fn max_nb_contributions(&self) -> u64 {
        self.model_type.max_nb_contributions()
    }

    /// Gets the shift which moves the bounded numbers into the non-negative reals.
    pub fn add_shift(&self) -> Ratio<BigInt> {
        Ratio::from_integer(BigInt::from(self.bound()))
    }

    /// Gets the shift which moves the shifted numbers into the non-negative integers.
    pub fn exp_shift(&self) -> BigInt {
        BigInt::from(10_u8).pow(DECIMAL_PLACES)
    }

    /// Gets the largest encoding of a single number, i.e. the encoding of the upper bound.
    pub fn max_encoding(&self) -> BigUint {
        BigUint::from(2_u8) * self.bound() * BigUint::from(10_u8).pow(DECIMAL_PLACES)
    }

    /// Gets the order of the finite group.
    ///
    /// The group holds the sum of the maximum number of contributions without overflow.
    pub fn order(&self) -> BigUint {
        let exact = self.max_encoding() * self.max_nb_contributions() + BigUint::one();
        match self.group_type {
            GroupType::Integer => exact,
            GroupType::Power2 => BigUint::one() << exact.bits(),
        }
    }

    /// Gets the number of bytes needed to represent the largest element of the finite group.
    pub fn element_len(&self) -> usize {
        (self.order() - BigUint::one()).to_bytes_le().len()
    }
}

#[cfg(test)]
mod tests {
    use num::traits::Zero;

    use super::*;

    fn config(group_type: GroupType, bound_type: BoundType, model_type: ModelType) -> MaskConfig {
        MaskConfig {
            group_type,
            bound_type,
            model_type,
        }
    }

    #[test]
    fn test_bounds() {
        let bounds = [
            (BoundType::B0, 1),
            (BoundType::B2, 100),
            (BoundType::B4, 10_000),
            (BoundType::B6, 1_000_000),
        ];
        for (bound_type, bound) in bounds.iter() {
            assert_eq!(
                config(GroupType::Integer, *bound_type, ModelType::M3).bound(),
                *bound
            );
        }
        assert_eq!(ModelType::M12.max_nb_contributions(), 1_000_000_000_000);
    }

    #[test]
    fn test_integer_order() {
        let config = config(GroupType::Integer, BoundType::B0, ModelType::M3);
        assert_eq!(config.order(), BigUint::from(20_000_000_000_001_u64));
        assert_eq!(config.exp_shift(), BigInt::from(10_000_000_000_u64));
        assert_eq!(config.add_shift(), Ratio::from_integer(BigInt::from(1)));
    }

    #[test]
    fn test_power2_order() {
        let config = config(GroupType::Power2, BoundType::B0, ModelType::M3);
        let order = config.order();
        // 2^45 is the smallest power of two above 20_000_000_000_001
        assert_eq!(order, BigUint::one() << 45_usize);
        assert!((order.clone() - BigUint::one()) & order == BigUint::zero());
    }

    #[test]
    fn test_order_holds_max_sum() {
        for group_type in [GroupType::Integer, GroupType::Power2].iter() {
            let config = config(*group_type, BoundType::B6, ModelType::M6);
            assert!(config.order() > config.max_encoding() * config.max_nb_contributions());
        }
    }
}
