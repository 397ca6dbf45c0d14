// SPDX-License-Identifier: Apache-2.0 OR MIT
//! Field-level checks shared by configuration and control command handling.

use std::net::Ipv4Addr;

/// Linux IFNAMSIZ - 1
pub const MAX_INTERFACE_NAME_LEN: usize = 15;
/// Largest 20-bit MPLS label value
pub const MAX_MPLS_LABEL: u32 = (1 << 20) - 1;
pub const MAX_VLAN_ID: u16 = 4095;

pub type ValidationResult = Result<(), String>;

#[inline]
pub fn is_valid_unicast(addr: Ipv4Addr) -> bool {
    !addr.is_multicast() && !addr.is_broadcast() && !addr.is_unspecified()
}

pub fn validate_unicast_address(addr: Ipv4Addr, context: &str) -> ValidationResult {
    if is_valid_unicast(addr) {
        Ok(())
    } else {
        Err(format!("{context} must be a unicast address, got {addr}"))
    }
}

/// Interface names follow kernel rules; ':' is accepted for aliases.
pub fn validate_interface_name(name: &str) -> ValidationResult {
    if name.is_empty() {
        return Err("interface name cannot be empty".to_string());
    }
    if name.len() > MAX_INTERFACE_NAME_LEN {
        return Err(format!(
            "interface name '{name}' exceeds {MAX_INTERFACE_NAME_LEN} characters"
        ));
    }
    if let Some(c) = name
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':')))
    {
        return Err(format!("interface name '{name}' contains invalid character '{c}'"));
    }
    match name.chars().next() {
        Some(first) if first.is_ascii_digit() || first == '-' || first == '.' => Err(format!(
            "interface name '{name}' cannot start with '{first}'"
        )),
        _ => Ok(()),
    }
}

/// 0 means "no label" and is accepted.
pub fn validate_label(label: u32, context: &str) -> ValidationResult {
    if label > MAX_MPLS_LABEL {
        return Err(format!(
            "{context}: label {label} exceeds {MAX_MPLS_LABEL}"
        ));
    }
    Ok(())
}

pub fn validate_vlan_id(vlan: u16, context: &str) -> ValidationResult {
    if vlan > MAX_VLAN_ID {
        return Err(format!("{context}: vlan {vlan} exceeds {MAX_VLAN_ID}"));
    }
    Ok(())
}

pub fn validate_port(port: u16, context: &str) -> ValidationResult {
    if port == 0 {
        return Err(format!("{context} cannot be 0"));
    }
    Ok(())
}
