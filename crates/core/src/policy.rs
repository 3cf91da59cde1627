//! Trust policy for watched-flag transitions.
//!
//! Inconclusive signals (playback heartbeats) must not flip the watched
//! flag on their own. Every call site goes through this one function; the
//! entity merge itself stays policy-free.

use crate::entity::{META_PLAYED_AT, StateEntity, value_as_i64};

/// Whether a candidate is trusted to flip the stored watched flag.
///
/// Untainted candidates (explicit mark-played/unplayed, scrobble-complete)
/// always are. Tainted candidates are trusted only when their own backend
/// metadata corroborates the flip with a `played_at` equal to the new
/// `updated` timestamp.
pub fn can_flip_watched(remote: &StateEntity) -> bool {
    if !remote.tainted {
        return true;
    }

    let Some(meta) = remote.backend_metadata(&remote.via) else {
        return false;
    };

    meta.get(META_PLAYED_AT)
        .and_then(value_as_i64)
        .is_some_and(|played_at| played_at == remote.updated)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MediaKind;
    use serde_json::json;

    fn candidate(tainted: bool) -> StateEntity {
        let mut e = StateEntity::new(MediaKind::Movie);
        e.via = "plex_home".into();
        e.updated = 1700000000;
        e.watched = true;
        e.tainted = tainted;
        e
    }

    #[test]
    fn untainted_candidates_are_trusted() {
        assert!(can_flip_watched(&candidate(false)));
    }

    #[test]
    fn tainted_without_corroboration_is_refused() {
        assert!(!can_flip_watched(&candidate(true)));
    }

    #[test]
    fn tainted_with_matching_played_at_is_trusted() {
        let mut e = candidate(true);
        e.metadata
            .insert("plex_home".into(), json!({ "played_at": 1700000000 }));
        assert!(can_flip_watched(&e));

        e.metadata
            .insert("plex_home".into(), json!({ "played_at": "1699999999" }));
        assert!(!can_flip_watched(&e));
    }
}
