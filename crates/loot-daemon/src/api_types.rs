//! Response types specific to loot-daemon endpoints.
//!
//! Request bodies and the error envelope are shared with clients and live in
//! `loot_schemas::api`. No business logic lives here.

use loot_schemas::{Account, ItemInstance};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// /v1/health
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub ok: bool,
    pub service: String,
    pub version: String,
}

// ---------------------------------------------------------------------------
// /v1/accounts/:identity
// ---------------------------------------------------------------------------

/// Both representations of an account's holdings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountResponse {
    pub account: Account,
    pub instances: Vec<ItemInstance>,
}
