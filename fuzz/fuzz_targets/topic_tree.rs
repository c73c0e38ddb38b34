#![no_main]

use std::hint::black_box;

use libfuzzer_sys::arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;

use mqttd::topic::{Filter, SubscriptionTree, TopicName};

#[derive(Debug, Arbitrary)]
struct Data {
    filters: Vec<String>,
    topic: String,
}

fuzz_target!(|data: Data| {
    let mut tree = SubscriptionTree::new();
    let mut inserted = Vec::new();

    for (key, raw) in data.filters.iter().enumerate() {
        if let Ok(filter) = raw.parse::<Filter>() {
            tree.subscribe(&filter, key, ());
            inserted.push((key, filter));
        }
    }

    // The tree must agree with the reference predicate for every stored
    // filter.
    if let Ok(topic) = TopicName::parse(&data.topic) {
        let mut matched = Vec::new();
        tree.visit_matches(&topic, |&key, _| matched.push(key));
        matched.sort_unstable();

        let mut expected: Vec<usize> = inserted
            .iter()
            .filter(|(_, filter)| filter.matches(&topic))
            .map(|&(key, _)| key)
            .collect();
        expected.sort_unstable();

        assert_eq!(black_box(matched), expected);
    }

    // Removing everything must leave the tree structurally empty.
    for (key, filter) in &inserted {
        assert!(tree.unsubscribe(filter, key).is_some());
    }

    assert!(tree.is_empty());
});
