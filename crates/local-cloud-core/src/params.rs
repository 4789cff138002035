//! Worker configuration parameters shared between the provider and the
//! workers it launches.
//!
//! The provider writes [`TEMPLATE_ID_PARAM`] and [`INSTANCE_ID_PARAM`] into
//! every staged worker configuration. When the worker later registers with
//! the orchestrator it reports its configuration parameters back, and the two
//! values identify the instance it belongs to.

use std::collections::HashMap;

use crate::ids::{InstanceId, TemplateId};

/// Configuration parameter carrying the owning template's identifier.
pub const TEMPLATE_ID_PARAM: &str = "cloud.local.image.id";

/// Configuration parameter carrying the instance identifier.
pub const INSTANCE_ID_PARAM: &str = "cloud.local.instance.id";

/// Extract the (template, instance) pair a worker reports.
///
/// Returns `None` if either parameter is missing or malformed.
#[must_use]
pub fn correlation(params: &HashMap<String, String>) -> Option<(TemplateId, InstanceId)> {
    let template_id = TemplateId::parse(params.get(TEMPLATE_ID_PARAM)?).ok()?;
    let instance_id = InstanceId::parse(params.get(INSTANCE_ID_PARAM)?).ok()?;
    Some((template_id, instance_id))
}

/// Returns true if the worker carries both correlation parameters.
///
/// This is the admission check for "does this worker belong to a local cloud
/// provider".
#[must_use]
pub fn carries_correlation(params: &HashMap<String, String>) -> bool {
    params.contains_key(TEMPLATE_ID_PARAM) && params.contains_key(INSTANCE_ID_PARAM)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[test]
    fn correlation_reads_both_ids() {
        let p = params(&[(TEMPLATE_ID_PARAM, "2"), (INSTANCE_ID_PARAM, "5")]);
        let (template_id, instance_id) = correlation(&p).unwrap();
        assert_eq!(template_id.as_str(), "2");
        assert_eq!(instance_id.as_str(), "5");
        assert!(carries_correlation(&p));
    }

    #[test]
    fn correlation_requires_both() {
        let p = params(&[(TEMPLATE_ID_PARAM, "2")]);
        assert!(correlation(&p).is_none());
        assert!(!carries_correlation(&p));
    }

    #[test]
    fn correlation_rejects_malformed_ids() {
        let p = params(&[(TEMPLATE_ID_PARAM, "2"), (INSTANCE_ID_PARAM, "")]);
        assert!(correlation(&p).is_none());
        assert!(carries_correlation(&p));
    }
}
