use crate::SessionReport;

/// Pretty-printed session report, including every replayed check.
pub fn render_json(report: &SessionReport) -> serde_json::Result<String> {
    serde_json::to_string_pretty(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::OffsetDateTime;

    #[test]
    fn test_render_json_carries_stats() {
        let report = SessionReport::new("shop", OffsetDateTime::now_utc(), None, Vec::new());
        let rendered = render_json(&report).unwrap();
        let value: serde_json::Value = serde_json::from_str(&rendered).unwrap();
        assert_eq!(value["app_id"], "shop");
        assert_eq!(value["stats"]["total_checks"], 0);
        assert!(value["ended_at"].is_null());
    }
}
