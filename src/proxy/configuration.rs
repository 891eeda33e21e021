//! Proxy configuration messages.
//!
//! ```text
//! [ opcode (1) ] [ parameters ]
//!
//! 0x00 Set Filter Type    [ filter type (1) ]
//! 0x01 Add Addresses      [ address (2) ]*
//! 0x02 Remove Addresses   [ address (2) ]*
//! 0x03 Filter Status      [ filter type (1) | list size (2) ]
//! ```

use crate::core::{Address, PduError};

const OPCODE_SET_FILTER_TYPE: u8 = 0x00;
const OPCODE_ADD_ADDRESSES: u8 = 0x01;
const OPCODE_REMOVE_ADDRESSES: u8 = 0x02;
const OPCODE_FILTER_STATUS: u8 = 0x03;

/// Proxy filter type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterType {
    /// Forward only listed addresses.
    AcceptList,
    /// Forward everything except listed addresses.
    RejectList,
}

impl FilterType {
    fn from_byte(byte: u8) -> Result<Self, PduError> {
        match byte {
            0x00 => Ok(Self::AcceptList),
            0x01 => Ok(Self::RejectList),
            _ => Err(PduError::InvalidField("filter type")),
        }
    }

    fn as_byte(self) -> u8 {
        match self {
            Self::AcceptList => 0x00,
            Self::RejectList => 0x01,
        }
    }
}

/// A message exchanged with a proxy node about its filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProxyConfigurationMessage {
    /// Select the filter type and clear the list.
    SetFilterType(FilterType),
    /// Add addresses to the filter.
    AddAddresses(Vec<Address>),
    /// Remove addresses from the filter.
    RemoveAddresses(Vec<Address>),
    /// Current filter state, sent by the proxy.
    FilterStatus {
        /// Active filter type.
        filter_type: FilterType,
        /// Number of addresses in the list.
        list_size: u16,
    },
}

impl ProxyConfigurationMessage {
    /// Opcode byte.
    pub fn opcode(&self) -> u8 {
        match self {
            Self::SetFilterType(_) => OPCODE_SET_FILTER_TYPE,
            Self::AddAddresses(_) => OPCODE_ADD_ADDRESSES,
            Self::RemoveAddresses(_) => OPCODE_REMOVE_ADDRESSES,
            Self::FilterStatus { .. } => OPCODE_FILTER_STATUS,
        }
    }

    /// Serialize into the transport payload.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = vec![self.opcode()];
        match self {
            Self::SetFilterType(filter_type) => out.push(filter_type.as_byte()),
            Self::AddAddresses(addresses) | Self::RemoveAddresses(addresses) => {
                for address in addresses {
                    out.extend_from_slice(&address.to_be_bytes());
                }
            }
            Self::FilterStatus {
                filter_type,
                list_size,
            } => {
                out.push(filter_type.as_byte());
                out.extend_from_slice(&list_size.to_be_bytes());
            }
        }
        out
    }

    /// Parse a decrypted transport payload.
    pub fn decode(data: &[u8]) -> Result<Self, PduError> {
        let (&opcode, params) = data.split_first().ok_or(PduError::TooShort {
            expected: 1,
            actual: 0,
        })?;
        match opcode {
            OPCODE_SET_FILTER_TYPE => match params {
                [filter_type] => Ok(Self::SetFilterType(FilterType::from_byte(*filter_type)?)),
                _ => Err(PduError::InvalidField("Set Filter Type length")),
            },
            OPCODE_ADD_ADDRESSES => Ok(Self::AddAddresses(addresses(params)?)),
            OPCODE_REMOVE_ADDRESSES => Ok(Self::RemoveAddresses(addresses(params)?)),
            OPCODE_FILTER_STATUS => match params {
                [filter_type, hi, lo] => Ok(Self::FilterStatus {
                    filter_type: FilterType::from_byte(*filter_type)?,
                    list_size: u16::from_be_bytes([*hi, *lo]),
                }),
                _ => Err(PduError::InvalidField("Filter Status length")),
            },
            _ => Err(PduError::InvalidOpcode),
        }
    }
}

fn addresses(params: &[u8]) -> Result<Vec<Address>, PduError> {
    if params.len() % 2 != 0 {
        return Err(PduError::InvalidField("address list length"));
    }
    Ok(params
        .chunks_exact(2)
        .map(|pair| Address::from_be_bytes([pair[0], pair[1]]))
        .collect())
}
