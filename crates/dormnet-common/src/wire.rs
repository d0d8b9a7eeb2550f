//! Versioned JSON documents exchanged between the daemons

use crate::{CommonError, CommonResult, VlanRuleset};
use serde::{Deserialize, Serialize};

/// Version written into every ruleset batch
pub const WIRE_VERSION: u32 = 1;

/// Body of `POST /api/firewall/rules`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RulesetBatch {
    /// Document version
    pub version: u32,
    /// Rulesets to activate, in order
    pub rulesets: Vec<VlanRuleset>,
}

/// Serialize rulesets into a batch document
pub fn encode_batch(rulesets: &[VlanRuleset]) -> CommonResult<Vec<u8>> {
    #[derive(Serialize)]
    struct BatchRef<'a> {
        version: u32,
        rulesets: &'a [VlanRuleset],
    }

    Ok(serde_json::to_vec(&BatchRef {
        version: WIRE_VERSION,
        rulesets,
    })?)
}

/// Parse a batch document, rejecting unknown versions
pub fn decode_batch(body: &[u8]) -> CommonResult<Vec<VlanRuleset>> {
    let batch: RulesetBatch = serde_json::from_slice(body)?;
    if batch.version != WIRE_VERSION {
        return Err(CommonError::UnsupportedVersion {
            found: batch.version,
            expected: WIRE_VERSION,
        });
    }
    Ok(batch.rulesets)
}
