use crate::error::GatewayError;
use crate::types::NotificationReport;

/// Checks that a report is a well-formed chain: strictly increasing ids,
/// every message pointing at its predecessor (the first one at the report's
/// `previous_id`) and `maximum_id` covering the last message.
pub fn validate_report(report: &NotificationReport) -> Result<(), GatewayError> {
    let mut expected_previous = report.previous_id;
    for message in &report.messages {
        if message.id <= expected_previous {
            return Err(GatewayError::InvalidReport(format!(
                "notification ids must be strictly increasing (id {} after {})",
                message.id, expected_previous
            )));
        }
        if message.previous_id != expected_previous {
            return Err(GatewayError::InvalidReport(format!(
                "notification {} points at {} instead of {}",
                message.id, message.previous_id, expected_previous
            )));
        }
        expected_previous = message.id;
    }

    if report.maximum_id < expected_previous {
        return Err(GatewayError::InvalidReport(format!(
            "maximum id {} is below last notification {}",
            report.maximum_id, expected_previous
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::NotificationMessage;

    fn chain(ids: &[i64]) -> Vec<NotificationMessage> {
        ids.iter().map(|id| NotificationMessage::new(*id, id - 1, "noop")).collect()
    }

    #[test]
    fn accepts_contiguous_chain_and_truncated_report() {
        assert!(validate_report(&NotificationReport::new(0, 3, chain(&[1, 2, 3]))).is_ok());
        assert!(validate_report(&NotificationReport::new(4, 9, chain(&[5, 6]))).is_ok());
        assert!(validate_report(&NotificationReport::empty(4, 9)).is_ok());
    }

    #[test]
    fn rejects_broken_link() {
        let mut messages = chain(&[1, 2, 3]);
        messages[2].previous_id = 1;
        let err = validate_report(&NotificationReport::new(0, 3, messages)).expect_err("broken");
        assert!(matches!(err, GatewayError::InvalidReport(reason) if reason.contains("points at 1")));
    }

    #[test]
    fn rejects_out_of_order_ids() {
        let messages = vec![NotificationMessage::new(2, 1, "noop"), NotificationMessage::new(1, 2, "noop")];
        let err = validate_report(&NotificationReport::new(1, 2, messages)).expect_err("reorder");
        assert!(matches!(err, GatewayError::InvalidReport(_)));
    }

    #[test]
    fn rejects_maximum_below_last_message() {
        let err = validate_report(&NotificationReport::new(0, 1, chain(&[1, 2])))
            .expect_err("maximum too low");
        assert!(matches!(err, GatewayError::InvalidReport(reason) if reason.contains("maximum id 1")));
    }
}
