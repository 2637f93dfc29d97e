//! Allow-list policy shared by several precompiles. Roles live in the
//! precompile's own storage, keyed by the subject address left-padded to a
//! slot. Role reads are public; writes require caller >= Manager, and a
//! Manager may only move addresses between None and Enabled.

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

use crate::common::{Addr, Bytes, Gas, Hash};
use crate::error::{StateError, VmError};
use crate::state::MutableState;

use super::{
    addr_word, deduct_gas, revert, selector, word_addr, write_protection,
    PrecompileEnv, PrecompileResult,
};

pub const MODIFY_ALLOW_LIST_GAS: Gas = 20_000;
pub const READ_ALLOW_LIST_GAS: Gas = 5_000;

static SET_ADMIN: Lazy<[u8; 4]> = Lazy::new(|| selector("setAdmin(address)"));
static SET_MANAGER: Lazy<[u8; 4]> =
    Lazy::new(|| selector("setManager(address)"));
static SET_ENABLED: Lazy<[u8; 4]> =
    Lazy::new(|| selector("setEnabled(address)"));
static SET_NONE: Lazy<[u8; 4]> = Lazy::new(|| selector("setNone(address)"));
static READ_ALLOW_LIST: Lazy<[u8; 4]> =
    Lazy::new(|| selector("readAllowList(address)"));

/// Role numbering is part of the storage format and must never change.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Role {
    None = 0,
    Enabled = 1,
    Admin = 2,
    Manager = 3,
}

impl Role {
    pub fn from_slot(value: &Hash) -> Role {
        let raw = value.as_bytes();
        if raw[..31].iter().any(|b| *b != 0) {
            // unknown encodings read as no permission
            return Role::None
        }
        match raw[31] {
            1 => Role::Enabled,
            2 => Role::Admin,
            3 => Role::Manager,
            _ => Role::None,
        }
    }

    pub fn to_slot(self) -> Hash {
        let mut raw = [0u8; 32];
        raw[31] = self as u8;
        Hash::from_slice(&raw)
    }

    /// Enabled, Manager and Admin may all exercise the host precompile's
    /// privileged operations.
    pub fn is_enabled(self) -> bool {
        !matches!(self, Role::None)
    }

    /// Whether a caller with this role may move `from` to `to`.
    pub fn can_modify(self, from: Role, to: Role) -> bool {
        match self {
            Role::Admin => true,
            Role::Manager => {
                matches!(from, Role::None | Role::Enabled)
                    && matches!(to, Role::None | Role::Enabled)
            }
            _ => false,
        }
    }
}

fn role_slot(addr: &Addr) -> Hash {
    Hash::from_slice(&addr_word(addr))
}

pub fn get_role(
    state: &MutableState, precompile: &Addr, addr: &Addr,
) -> Result<Role, StateError> {
    Ok(Role::from_slot(&state.storage(precompile, &role_slot(addr))?))
}

pub fn set_role(
    state: &mut MutableState, precompile: &Addr, addr: &Addr, role: Role,
) -> Result<(), StateError> {
    state.set_storage(precompile, role_slot(addr), role.to_slot())
}

/// Initial role grants carried in a precompile's activation params.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AllowListConfig {
    #[serde(default)]
    pub admin_addresses: Vec<Addr>,
    #[serde(default)]
    pub manager_addresses: Vec<Addr>,
    #[serde(default)]
    pub enabled_addresses: Vec<Addr>,
}

pub fn configure_allow_list(
    config: &AllowListConfig, precompile: &Addr, state: &mut MutableState,
) -> Result<(), VmError> {
    let grants = [
        (Role::Admin, &config.admin_addresses),
        (Role::Manager, &config.manager_addresses),
        (Role::Enabled, &config.enabled_addresses),
    ];
    for (role, addrs) in grants {
        for addr in addrs {
            set_role(state, precompile, addr, role)
                .map_err(|e| VmError::Corrupted(e.to_string()))?;
        }
    }
    Ok(())
}

/// Handle the shared allow-list selectors for the precompile at `host`.
/// Returns `None` for selectors the host module must handle itself.
pub fn run_allow_list(
    env: &mut PrecompileEnv, host: &Addr, input: &[u8], gas: Gas,
) -> Option<PrecompileResult> {
    if input.len() < 4 {
        return None
    }
    let (sel, args) = input.split_at(4);
    if sel == &*READ_ALLOW_LIST {
        let gas_left = match deduct_gas(gas, READ_ALLOW_LIST_GAS) {
            Ok(g) => g,
            Err(res) => return Some(res),
        };
        let addr = match word_addr(args) {
            Some(addr) => addr,
            None => return Some(revert(gas_left)),
        };
        let role = match get_role(env.state, host, &addr) {
            Ok(role) => role,
            Err(_) => return Some(revert(gas_left)),
        };
        let word = role.to_slot().to_fixed_bytes().to_vec();
        return Some((Bytes::from(word), gas_left, None))
    }

    let target_role = if sel == &*SET_ADMIN {
        Role::Admin
    } else if sel == &*SET_MANAGER {
        Role::Manager
    } else if sel == &*SET_ENABLED {
        Role::Enabled
    } else if sel == &*SET_NONE {
        Role::None
    } else {
        return None
    };

    let gas_left = match deduct_gas(gas, MODIFY_ALLOW_LIST_GAS) {
        Ok(g) => g,
        Err(res) => return Some(res),
    };
    if env.read_only {
        return Some(write_protection())
    }
    let target = match word_addr(args) {
        Some(addr) => addr,
        None => return Some(revert(gas_left)),
    };
    let caller = env.caller.clone();
    let caller_role = match get_role(env.state, host, &caller) {
        Ok(role) => role,
        Err(_) => return Some(revert(gas_left)),
    };
    let current = match get_role(env.state, host, &target) {
        Ok(role) => role,
        Err(_) => return Some(revert(gas_left)),
    };
    if !caller_role.can_modify(current, target_role) {
        return Some(revert(gas_left))
    }
    if set_role(env.state, host, &target, target_role).is_err() {
        return Some(revert(gas_left))
    }
    Some((Bytes::empty(), gas_left, None))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_slot_roundtrip() {
        for role in [Role::None, Role::Enabled, Role::Admin, Role::Manager] {
            assert_eq!(Role::from_slot(&role.to_slot()), role);
        }
        // junk in the upper bytes means no permission
        let mut raw = [0u8; 32];
        raw[0] = 0xff;
        raw[31] = 2;
        assert_eq!(Role::from_slot(&Hash::from_slice(&raw)), Role::None);
    }

    #[test]
    fn modification_matrix() {
        let admin = Role::Admin;
        let manager = Role::Manager;
        assert!(admin.can_modify(Role::None, Role::Admin));
        assert!(admin.can_modify(Role::Manager, Role::None));
        assert!(manager.can_modify(Role::None, Role::Enabled));
        assert!(manager.can_modify(Role::Enabled, Role::None));
        assert!(!manager.can_modify(Role::None, Role::Manager));
        assert!(!manager.can_modify(Role::Admin, Role::None));
        assert!(!Role::Enabled.can_modify(Role::None, Role::Enabled));
        assert!(!Role::None.can_modify(Role::None, Role::Enabled));
    }
}
