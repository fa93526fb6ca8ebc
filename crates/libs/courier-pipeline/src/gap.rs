use courier_core::{validate_report, Cursor, GatewayError, NotificationReport, RemoteReportGateway};
use std::sync::Arc;

/// Why an ingested report could not be processed as delivered.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GapReason {
    /// The report starts after the cursor, so messages in between are missing.
    AheadOfCursor { previous_id: i64, last_processed_id: i64 },
    /// The report's own bookkeeping does not hold together.
    Malformed(String),
}

/// Returns the reason `report` cannot be used against `cursor`, if any.
pub fn detect_gap(report: &NotificationReport, cursor: &Cursor) -> Option<GapReason> {
    if let Err(err) = validate_report(report) {
        return Some(GapReason::Malformed(err.to_string()));
    }
    if report.previous_id > cursor.last_processed_id {
        return Some(GapReason::AheadOfCursor {
            previous_id: report.previous_id,
            last_processed_id: cursor.last_processed_id,
        });
    }
    None
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedReport {
    pub report: NotificationReport,
    /// `maximum_id` of the report as it was ingested, before any refetch.
    pub submitted_maximum_id: i64,
    pub refetched: bool,
}

#[derive(Clone)]
pub struct GapResolver {
    gateway: Arc<dyn RemoteReportGateway>,
}

impl GapResolver {
    pub fn new(gateway: Arc<dyn RemoteReportGateway>) -> Self {
        Self { gateway }
    }

    /// Makes `report` contiguous with `cursor`, replacing it with a fresh
    /// fetch from the cursor when a gap is detected.
    pub fn resolve(
        &self,
        report: NotificationReport,
        cursor: &Cursor,
    ) -> Result<ResolvedReport, GatewayError> {
        let submitted_maximum_id = report.maximum_id;
        let Some(reason) = detect_gap(&report, cursor) else {
            return Ok(ResolvedReport { report, submitted_maximum_id, refetched: false });
        };

        match &reason {
            GapReason::AheadOfCursor { previous_id, last_processed_id } => log::info!(
                target: "courier::gap",
                "gap detected previous_id={previous_id} last_processed_id={last_processed_id}, refetching"
            ),
            GapReason::Malformed(detail) => log::warn!(
                target: "courier::gap",
                "ingested report is malformed ({detail}), refetching from {}",
                cursor.last_processed_id
            ),
        }
        let fresh = self.fetch_from(cursor.last_processed_id)?;
        Ok(ResolvedReport { report: fresh, submitted_maximum_id, refetched: true })
    }

    /// Fetches everything after `last_processed_id`. A report that fails
    /// validation counts as a failed fetch.
    pub fn fetch_from(&self, last_processed_id: i64) -> Result<NotificationReport, GatewayError> {
        let report = self.gateway.fetch_after(last_processed_id).map_err(|err| {
            log::warn!(
                target: "courier::gap",
                "fetch after {last_processed_id} failed: {err}"
            );
            err
        })?;
        validate_report(&report).map_err(|err| {
            log::warn!(
                target: "courier::gap",
                "fetched report after {last_processed_id} rejected: {err}"
            );
            err
        })?;
        log::debug!(
            target: "courier::gap",
            "fetched after {last_processed_id}: {} messages, maximum_id={}",
            report.messages.len(),
            report.maximum_id
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_core::NotificationMessage;
    use test_support::{chain, report_of, report_with_max, ScriptedGateway};

    #[test]
    fn contiguous_or_overlapping_reports_are_usable() {
        let cursor = Cursor::new(3, 0);
        assert_eq!(detect_gap(&report_of(chain(4..=6)), &cursor), None);
        assert_eq!(detect_gap(&report_of(chain(1..=6)), &cursor), None);
        assert_eq!(detect_gap(&NotificationReport::empty(3, 3), &cursor), None);
    }

    #[test]
    fn report_starting_past_cursor_is_a_gap() {
        let cursor = Cursor::new(5, 0);
        assert_eq!(
            detect_gap(&report_of(chain(21..=22)), &cursor),
            Some(GapReason::AheadOfCursor { previous_id: 20, last_processed_id: 5 })
        );
    }

    #[test]
    fn malformed_report_is_treated_as_gap() {
        let broken = NotificationReport::new(
            0,
            3,
            vec![NotificationMessage::new(1, 0, "noop"), NotificationMessage::new(3, 2, "noop")],
        );
        assert!(matches!(detect_gap(&broken, &Cursor::default()), Some(GapReason::Malformed(_))));
    }

    #[test]
    fn gap_triggers_fetch_from_cursor() {
        let gateway = ScriptedGateway::new();
        gateway.script(5, Ok(report_with_max(20, chain(6..=10))));
        let resolver = GapResolver::new(Arc::new(gateway.clone()));

        let resolved =
            resolver.resolve(report_of(chain(21..=22)), &Cursor::new(5, 0)).expect("resolve");
        assert!(resolved.refetched);
        assert_eq!(resolved.submitted_maximum_id, 22);
        assert_eq!(resolved.report.last_id(), Some(10));
        assert_eq!(gateway.fetches(), vec![5]);
    }

    #[test]
    fn usable_report_is_not_refetched() {
        let gateway = ScriptedGateway::new();
        let resolver = GapResolver::new(Arc::new(gateway.clone()));
        let resolved = resolver.resolve(report_of(chain(1..=2)), &Cursor::default()).expect("resolve");
        assert!(!resolved.refetched);
        assert!(gateway.fetches().is_empty());
    }

    #[test]
    fn invalid_fetched_report_is_a_fetch_failure() {
        let gateway = ScriptedGateway::new();
        gateway.script(
            0,
            Ok(NotificationReport::new(0, 1, vec![NotificationMessage::new(2, 1, "noop")])),
        );
        let resolver = GapResolver::new(Arc::new(gateway));
        let err = resolver.fetch_from(0).expect_err("broken chain");
        assert!(matches!(err, GatewayError::InvalidReport(_)));
    }
}
