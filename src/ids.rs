use uuid::Uuid;

use crate::error::IngestionError;

/// Fresh time-ordered id for events and lazily created persons.
pub fn new_event_uuid() -> Uuid {
    Uuid::now_v7()
}

/// Validate a client-supplied event uuid. An absent uuid is fine (intake
/// layers may not assign one); a present-but-malformed one fails the event.
pub fn parse_event_uuid(raw: Option<&str>) -> Result<Uuid, IngestionError> {
    match raw {
        None => Ok(new_event_uuid()),
        Some(s) => Uuid::parse_str(s).map_err(|_| IngestionError::InvalidUuid(s.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_uuids_are_time_ordered() {
        let a = new_event_uuid();
        let b = new_event_uuid();
        assert!(a < b);
        assert_eq!(a.get_version_num(), 7);
    }

    #[test]
    fn test_parse_event_uuid() {
        let valid = "018f3e3e-7b2a-7c3d-9b2a-3e7b2a7c3d9b";
        assert_eq!(
            parse_event_uuid(Some(valid)).unwrap(),
            Uuid::parse_str(valid).unwrap()
        );
        assert!(parse_event_uuid(None).is_ok());
        assert!(matches!(
            parse_event_uuid(Some("not-a-uuid")),
            Err(IngestionError::InvalidUuid(_))
        ));
    }
}
