//! Line-oriented three-way merge for skill `modifies` files.

#[derive(Debug, Clone)]
pub struct MergeOutcome {
    pub content: String,
    pub conflicted: bool,
}

/// Merge `skill` changes into `current` against the `base` snapshot. With no
/// base (the file was introduced by a prior skill), the skill content wins
/// outright. A conflicted merge still yields content, with markers left in.
pub fn three_way_merge(base: Option<&str>, current: Option<&str>, skill: &str) -> MergeOutcome {
    let Some(base) = base else {
        return MergeOutcome {
            content: skill.to_string(),
            conflicted: false,
        };
    };
    let current = current.unwrap_or("");
    match diffy::merge(base, current, skill) {
        Ok(content) => MergeOutcome {
            content,
            conflicted: false,
        },
        Err(content) => MergeOutcome {
            content,
            conflicted: true,
        },
    }
}
