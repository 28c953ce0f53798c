//! Configuration validation utilities.
//!
//! This module provides the checks shared by the configuration record and
//! the network planner: controller object naming rules, the allowed tenant
//! counts, and pairwise overlap between planned roles.

use crate::ip::cidr::{self, CidrBlock};

/// Tenant counts the fabric supports
pub const ALLOWED_TENANT_COUNTS: [u32; 4] = [2, 4, 8, 16];

/// Longest zone or vnet id the controller accepts
pub const MAX_SDN_ID_LEN: usize = 8;

/// Validate a controller SDN object id
///
/// Ids must start with a lowercase letter, contain only lowercase letters
/// and digits, and fit in `max_len` characters.
///
/// # Returns
/// * `Ok(())` if the id is acceptable
/// * `Err(String)` describing the violated rule
pub fn validate_sdn_id(id: &str, max_len: usize) -> Result<(), String> {
    if id.is_empty() {
        return Err("id cannot be empty".to_string());
    }
    if id.len() > max_len {
        return Err(format!("id '{}' is longer than {} characters", id, max_len));
    }
    let mut chars = id.chars();
    if !chars.next().map_or(false, |c| c.is_ascii_lowercase()) {
        return Err(format!("id '{}' must start with a lowercase letter", id));
    }
    if !chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()) {
        return Err(format!("id '{}' may only contain lowercase letters and digits", id));
    }
    Ok(())
}

/// Validate that `count` is one of [`ALLOWED_TENANT_COUNTS`]
pub fn validate_tenant_count(count: u32) -> Result<(), String> {
    if ALLOWED_TENANT_COUNTS.contains(&count) {
        Ok(())
    } else {
        Err(format!("tenant count {} must be one of {:?}", count, ALLOWED_TENANT_COUNTS))
    }
}

/// Find the first pair of roles whose blocks overlap
///
/// # Returns
/// * `Some((i, j))` with `i < j`, indexes into `roles`
/// * `None` if all blocks are disjoint
pub fn find_role_overlap(roles: &[(String, CidrBlock)]) -> Option<(usize, usize)> {
    for (i, (_, a)) in roles.iter().enumerate() {
        for (j, (_, b)) in roles.iter().enumerate().skip(i + 1) {
            if cidr::overlaps(a, b) {
                return Some((i, j));
            }
        }
    }
    None
}
