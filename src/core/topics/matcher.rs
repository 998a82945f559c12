use thiserror::Error;

/// Structural problems with a topic filter.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TopicError {
    #[error("topic filter must not be empty")]
    Empty,

    #[error("'+' must occupy a whole level in {0:?}")]
    SingleLevelPlacement(String),

    #[error("'#' must be the last level in {0:?}")]
    MultiLevelPlacement(String),

    #[error("bare '+' is not accepted as a filter")]
    BareSingleLevel,
}

/// How a filter consisting of exactly `+` is treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WildcardPolicy {
    /// Reject a bare `+` with [`TopicError::BareSingleLevel`].
    #[default]
    Strict,
    /// Accept a bare `+` as "any single-level topic".
    Lenient,
}

/// Matches subscription filters against concrete topic names.
#[derive(Debug, Clone, Copy, Default)]
pub struct TopicMatcher {
    policy: WildcardPolicy,
}

impl TopicMatcher {
    pub fn new(policy: WildcardPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> WildcardPolicy {
        self.policy
    }

    /// Checks wildcard placement without matching anything.
    pub fn validate_filter(&self, filter: &str) -> Result<(), TopicError> {
        if filter.is_empty() {
            return Err(TopicError::Empty);
        }
        if filter == "+" && self.policy == WildcardPolicy::Strict {
            return Err(TopicError::BareSingleLevel);
        }

        let levels: Vec<&str> = filter.split('/').collect();
        let last = levels.len() - 1;
        for (i, level) in levels.iter().enumerate() {
            if level.contains('+') && *level != "+" {
                return Err(TopicError::SingleLevelPlacement(filter.to_string()));
            }
            if level.contains('#') && (*level != "#" || i != last) {
                return Err(TopicError::MultiLevelPlacement(filter.to_string()));
            }
        }
        Ok(())
    }

    /// Returns whether `topic` is selected by `filter`.
    pub fn matches(&self, filter: &str, topic: &str) -> Result<bool, TopicError> {
        if !has_wildcards(filter) {
            return Ok(filter == topic);
        }
        self.validate_filter(filter)?;

        let system_topic = topic.starts_with('$');
        if filter == "#" {
            return Ok(!system_topic);
        }
        if system_topic && filter.starts_with(['+', '#']) {
            return Ok(false);
        }

        if let Some(prefix) = filter.strip_suffix('#') {
            if !prefix.contains('+') {
                return Ok(topic.starts_with(prefix));
            }
        }

        let mut topic_levels = topic.split('/');
        for level in filter.split('/') {
            match level {
                // like the prefix rule, `#` needs at least one level left
                "#" => return Ok(topic_levels.next().is_some()),
                "+" => {
                    if topic_levels.next().is_none() {
                        return Ok(false);
                    }
                }
                literal => {
                    if topic_levels.next() != Some(literal) {
                        return Ok(false);
                    }
                }
            }
        }
        Ok(topic_levels.next().is_none())
    }
}

/// [`TopicMatcher::matches`] under [`WildcardPolicy::Strict`].
pub fn matches(filter: &str, topic: &str) -> Result<bool, TopicError> {
    TopicMatcher::default().matches(filter, topic)
}

/// Strips a trailing `/#` or `#` from a filter.
pub fn filtered(pattern: &str) -> &str {
    pattern
        .strip_suffix("/#")
        .or_else(|| pattern.strip_suffix('#'))
        .unwrap_or(pattern)
}

pub fn has_wildcards(filter: &str) -> bool {
    filter.contains(['+', '#'])
}
