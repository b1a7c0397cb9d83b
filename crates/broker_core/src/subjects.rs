//! Well-known bus subjects and subscription pattern matching.
//!
//! Subjects are dot-separated tokens. Subscription patterns may use `*` to
//! match exactly one token and `>` to match the remainder of the subject.

/// Inbound story events; the final tokens carry the event type.
pub const STORY_EVENTS_WILDCARD: &str = "story.events.>";
pub const STORY_EVENTS_PREFIX: &str = "story.events.";

/// Outbound story subjects.
pub const STORY_DRIFT: &str = "events.story.v1.drift";
pub const STORY_CONFLICT_ALERT: &str = "events.story.v1.conflict_alert";
pub const STORY_ARC_COMPLETED: &str = "story.arc.completed";
pub const STORY_CONFLICT_DETECTED: &str = "story.conflict.detected";

/// Story request/reply API.
pub const STORY_GET_SNAPSHOT: &str = "story.get.snapshot";
pub const STORY_GET_ARC_PROGRESS: &str = "story.get.arc_progress";
pub const STORY_GET_RELATIONSHIPS: &str = "story.get.relationships";
pub const STORY_GET_STANDINGS: &str = "story.get.dark_world_standings";
pub const STORY_CHECK_DRIFT: &str = "story.check.drift";
pub const STORY_UPDATE_ARC_PROGRESS: &str = "story.update.arc_progress";
pub const STORY_UPDATE_RELATIONSHIP: &str = "story.update.relationship";
pub const STORY_UPDATE_STANDING: &str = "story.update.dark_world_standing";

/// Analyzer subjects.
pub const VISION_ANALYZE_REQUEST: &str = "vision.analyze.request";
pub const VISION_WORKER_GROUP: &str = "vision_analyzer_workers";
pub const VISION_ISSUE: &str = "vision.issue";
pub const VISION_SCENE_SUMMARY: &str = "vision.scene.summary";
pub const VISION_HEALTH: &str = "vision.health.analyzer";
pub const SYS_HEALTH_4D_VISION: &str = "SYS.HEALTH.4D_VISION";

/// Story service health subjects.
pub const STORY_HEALTH: &str = "story.health.memory";
pub const SYS_HEALTH_STORY: &str = "SYS.HEALTH.STORY_MEMORY";

/// Training orchestrator subjects.
pub const TRAINING_GENERATE: &str = "training.generate.examples";
pub const TRAINING_HEALTH: &str = "training.health.orchestrator";
pub const SYS_HEALTH_TRAINING: &str = "SYS.HEALTH.SRL_TRAINING";

/// Match a subject against a subscription pattern.
///
/// `*` matches exactly one token; `>` matches one or more remaining tokens
/// and is only meaningful as the final pattern token.
pub fn subject_matches(pattern: &str, subject: &str) -> bool {
    let mut pat = pattern.split('.');
    let mut sub = subject.split('.');

    loop {
        match (pat.next(), sub.next()) {
            (Some(">"), Some(_)) => return true,
            (Some(">"), None) => return false,
            (Some("*"), Some(_)) => {}
            (Some(p), Some(s)) if p == s => {}
            (Some(_), Some(_)) => return false,
            (None, None) => return true,
            (None, Some(_)) | (Some(_), None) => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_match() {
        assert!(subject_matches("vision.issue", "vision.issue"));
        assert!(!subject_matches("vision.issue", "vision.issues"));
    }

    #[test]
    fn single_token_wildcard() {
        assert!(subject_matches("story.*.snapshot", "story.get.snapshot"));
        assert!(!subject_matches("story.*.snapshot", "story.get.arc.snapshot"));
        assert!(!subject_matches("story.*", "story"));
    }

    #[test]
    fn tail_wildcard() {
        assert!(subject_matches("story.events.>", "story.events.arc.started"));
        assert!(subject_matches("story.events.>", "story.events.quest.completed"));
        // `>` requires at least one remaining token
        assert!(!subject_matches("story.events.>", "story.events"));
    }

    #[test]
    fn mismatched_lengths() {
        assert!(!subject_matches("a.b.c", "a.b"));
        assert!(!subject_matches("a.b", "a.b.c"));
    }
}
