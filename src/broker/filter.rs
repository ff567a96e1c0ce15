//! Subscription filter matching (4.7.1).

/// Match a topic name against a subscription filter.
///
/// `+` matches exactly one level, `#` matches the remaining levels including
/// the parent level itself (`a/#` matches `a`). The filter is assumed to
/// have passed [`mqtt_protocol::valid_filter`] already.
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(filter_level), Some(topic_level)) if filter_level == topic_level => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}
