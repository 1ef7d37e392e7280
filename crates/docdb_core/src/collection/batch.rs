//! Best-effort batch results.

use serde::Serialize;

/// One item of a batch that was not applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchFailure {
    /// Position of the item in the input, for inserts.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub index: Option<usize>,
    /// Document id, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Rendered error.
    pub error: String,
}

/// Outcome of a batch operation. One item failing never stops the others.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchResult {
    /// Items applied.
    pub success: usize,
    /// Items rejected, in input order.
    pub failures: Vec<BatchFailure>,
}

impl BatchResult {
    /// Returns true if every item was applied.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }

    pub(crate) fn fail(&mut self, index: Option<usize>, id: Option<String>, error: impl ToString) {
        self.failures.push(BatchFailure {
            index,
            id,
            error: error.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn serializes_without_absent_fields() {
        let mut result = BatchResult {
            success: 9,
            ..BatchResult::default()
        };
        result.fail(Some(5), None, "validation failed: bad");
        assert!(!result.is_complete());
        assert_eq!(
            serde_json::to_value(&result).unwrap(),
            json!({"success": 9, "failures": [{"index": 5, "error": "validation failed: bad"}]})
        );
    }
}
