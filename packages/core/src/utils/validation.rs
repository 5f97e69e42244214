use crate::utils::error::{ConclaveError, Result};
use std::collections::BTreeSet;

/// Максимальная длина id участника (в байтах)
pub const MAX_PARTICIPANT_ID_LEN: usize = 256;

/// Минимальное число различных участников беседы
pub const MIN_PARTICIPANTS: usize = 2;

pub fn validate_participant_id(id: &str) -> Result<()> {
    if id.trim().is_empty() {
        return Err(ConclaveError::InvalidParticipants(
            "Participant id must not be blank".to_string(),
        ));
    }
    if id.len() > MAX_PARTICIPANT_ID_LEN {
        return Err(ConclaveError::InvalidParticipants(format!(
            "Participant id must be at most {} bytes",
            MAX_PARTICIPANT_ID_LEN
        )));
    }
    Ok(())
}

/// Множество участников: `participant_ids` ∪ {creator}.
///
/// Повтор или пустой id в `participant_ids`, либо меньше двух различных
/// участников дают `InvalidParticipants`. Создатель в `participant_ids` повтором
/// не считается.
pub fn validate_participants<S: AsRef<str>>(
    creator_id: &str,
    participant_ids: &[S],
) -> Result<BTreeSet<String>> {
    validate_participant_id(creator_id)?;

    let mut listed = BTreeSet::new();
    for id in participant_ids {
        let id = id.as_ref();
        validate_participant_id(id)?;
        if !listed.insert(id.to_string()) {
            return Err(ConclaveError::InvalidParticipants(format!(
                "Duplicate participant: {}",
                id
            )));
        }
    }

    listed.insert(creator_id.to_string());
    if listed.len() < MIN_PARTICIPANTS {
        return Err(ConclaveError::InvalidParticipants(format!(
            "A conversation needs at least {} distinct participants",
            MIN_PARTICIPANTS
        )));
    }
    Ok(listed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_creator_is_added() {
        let set = validate_participants("alice", &["bob"]).unwrap();
        assert_eq!(
            set.into_iter().collect::<Vec<_>>(),
            vec!["alice".to_string(), "bob".to_string()]
        );
    }

    #[test]
    fn test_creator_may_be_listed() {
        let set = validate_participants("alice", &["alice", "bob"]).unwrap();
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_invalid_participant_sets() {
        let empty: [&str; 0] = [];
        for result in [
            validate_participants("alice", &empty),
            validate_participants("alice", &["alice"]),
            validate_participants("alice", &["bob", "bob"]),
            validate_participants("alice", &["bob", "  "]),
            validate_participants("", &["bob"]),
        ] {
            assert!(matches!(
                result,
                Err(ConclaveError::InvalidParticipants(_))
            ));
        }
    }
}
