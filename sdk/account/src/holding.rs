use serde::{Deserialize, Serialize};

use crate::AccountError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HoldingType {
    Coin,
    Asset,
    Currency,
}

impl HoldingType {
    pub fn code(self) -> u8 {
        match self {
            HoldingType::Coin => 0,
            HoldingType::Asset => 1,
            HoldingType::Currency => 2,
        }
    }

    pub fn from_code(code: u8) -> Result<Self, AccountError> {
        match code {
            0 => Ok(HoldingType::Coin),
            1 => Ok(HoldingType::Asset),
            2 => Ok(HoldingType::Currency),
            other => Err(AccountError::UnknownHoldingType(other)),
        }
    }
}

/// The fungible unit being moved: the native coin, an asset, or a
/// monetary-system currency.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Holding {
    Coin,
    Asset(u64),
    Currency(u64),
}

impl Holding {
    pub fn from_parts(holding_type: HoldingType, holding_id: u64) -> Result<Self, AccountError> {
        match holding_type {
            HoldingType::Coin if holding_id != 0 => Err(AccountError::CoinHoldingId(holding_id)),
            HoldingType::Coin => Ok(Holding::Coin),
            HoldingType::Asset => Ok(Holding::Asset(holding_id)),
            HoldingType::Currency => Ok(Holding::Currency(holding_id)),
        }
    }

    pub fn holding_type(&self) -> HoldingType {
        match self {
            Holding::Coin => HoldingType::Coin,
            Holding::Asset(_) => HoldingType::Asset,
            Holding::Currency(_) => HoldingType::Currency,
        }
    }

    /// Zero for the native coin.
    pub fn id(&self) -> u64 {
        match self {
            Holding::Coin => 0,
            Holding::Asset(id) | Holding::Currency(id) => *id,
        }
    }

    pub fn is_coin(&self) -> bool {
        matches!(self, Holding::Coin)
    }

    /// Storage key fragment: type code followed by the big-endian id.
    pub fn key_bytes(&self) -> [u8; 9] {
        let mut key = [0u8; 9];
        key[0] = self.holding_type().code();
        key[1..].copy_from_slice(&self.id().to_be_bytes());
        key
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parts_round_trip() {
        for holding in [Holding::Coin, Holding::Asset(5), Holding::Currency(9)] {
            let rebuilt = Holding::from_parts(holding.holding_type(), holding.id()).unwrap();
            assert_eq!(rebuilt, holding);
        }
    }

    #[test]
    fn coin_with_id_is_rejected() {
        assert_eq!(
            Holding::from_parts(HoldingType::Coin, 3),
            Err(AccountError::CoinHoldingId(3))
        );
        assert!(HoldingType::from_code(7).is_err());
    }
}
