//! Topic names, subscription filters and the wildcard matching tree.

use std::fmt::{self, Display, Formatter, Write};
use std::str::FromStr;

mod tree;

pub use tree::{SubscriptionTree, Tree};

/// A valid topic name as used in PUBLISH packets.
///
/// A topic name must not be zero-length, nor may it contain wildcard
/// characters or a null byte [MQTT-4.7.3-1], [MQTT-4.7.3-2].
#[derive(Debug)]
pub struct TopicName<'a> {
    levels: Vec<&'a str>,
}

impl<'a> TopicName<'a> {
    pub fn parse(s: &'a str) -> Result<Self, ParseError> {
        if s.is_empty() {
            return Err(ParseError::Empty);
        }

        if let Some((idx, ch)) = s.char_indices().find(|it| matches!(it.1, '#' | '+' | '\0')) {
            return Err(ParseError::UnexpectedCharacter { ch, idx });
        }

        Ok(Self {
            levels: s.split('/').collect(),
        })
    }

    pub fn levels(&self) -> &[&'a str] {
        &self.levels
    }

    /// Topics whose first level starts with `$` are reserved for the broker
    /// and are invisible to wildcards at the first level [MQTT-4.7.2-1].
    pub fn is_reserved(&self) -> bool {
        self.levels[0].starts_with('$')
    }
}

impl<'a> TryFrom<&'a str> for TopicName<'a> {
    type Error = ParseError;

    fn try_from(value: &'a str) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl Display for TopicName<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.levels[0])?;

        for level in &self.levels[1..] {
            f.write_char('/')?;
            f.write_str(level)?;
        }

        Ok(())
    }
}

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("unexpected character `{ch}` at {idx}")]
    UnexpectedCharacter { ch: char, idx: usize },
    #[error("topic name cannot be empty")]
    Empty,
}

/// A subscription filter: a topic pattern admitting `+` (exactly one level)
/// and a trailing `#` (the rest of the tree).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Filter {
    /// The unadulterated filter string. Must not be empty.
    string: String,
}

/// One level of a [`Filter`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Segment<'a> {
    Literal(&'a str),
    /// `+`
    SingleLevel,
    /// `#`; only ever the final segment.
    MultiLevel,
}

impl FromStr for Filter {
    type Err = FilterParseError;

    fn from_str(string: &str) -> Result<Self, Self::Err> {
        if string.is_empty() {
            return Err(FilterParseError::Empty);
        }

        if string.contains('\0') {
            return Err(FilterParseError::NullByte);
        }

        let mut levels = string.split('/').peekable();

        while let Some(level) = levels.next() {
            match level {
                // `#` must be the last level [MQTT-4.7.1-2].
                "#" if levels.peek().is_some() => {
                    return Err(FilterParseError::MultiLevelNotLast)
                }
                "#" | "+" => {}
                // Wildcards must occupy an entire level [MQTT-4.7.1-3].
                _ if level.contains(['#', '+']) => {
                    return Err(FilterParseError::InvalidWildcard)
                }
                _ => {}
            }
        }

        Ok(Filter {
            string: string.into(),
        })
    }
}

impl Filter {
    /// Reinterpret a concrete topic name as a (wildcard-free) filter.
    ///
    /// Used to key the retained store, which stores by exact publish topic.
    pub fn from_topic(topic: &TopicName<'_>) -> Self {
        Filter {
            string: topic.to_string(),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.string
    }

    pub(crate) fn segments(&self) -> impl Iterator<Item = Segment<'_>> {
        self.string.split('/').map(|level| match level {
            "+" => Segment::SingleLevel,
            "#" => Segment::MultiLevel,
            literal => Segment::Literal(literal),
        })
    }

    pub fn has_wildcards(&self) -> bool {
        self.segments()
            .any(|segment| !matches!(segment, Segment::Literal(_)))
    }

    /// The MQTT §4.7 matching predicate, used directly for small match sets
    /// and as the reference for [`Tree`].
    pub fn matches(&self, topic: &TopicName<'_>) -> bool {
        let mut segments = self.segments();

        // A wildcard at the first level never matches a `$`-topic.
        if topic.is_reserved()
            && matches!(
                self.segments().next(),
                Some(Segment::SingleLevel | Segment::MultiLevel)
            )
        {
            return false;
        }

        let mut levels = topic.levels().iter();

        loop {
            match (segments.next(), levels.next()) {
                (None, None) => return true,
                // `#` matches the remaining levels, including zero of them
                // [MQTT-4.7.1-2].
                (Some(Segment::MultiLevel), _) => return true,
                (Some(Segment::SingleLevel), Some(_)) => {}
                (Some(Segment::Literal(literal)), Some(level)) => {
                    if literal != *level {
                        return false;
                    }
                }
                (Some(_), None) | (None, Some(_)) => return false,
            }
        }
    }
}

impl Display for Filter {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.string)
    }
}

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum FilterParseError {
    #[error("filter cannot be empty")]
    Empty,
    #[error("filter cannot contain a null byte")]
    NullByte,
    #[error("`#` must be the last level of a filter")]
    MultiLevelNotLast,
    #[error("wildcards must occupy an entire level")]
    InvalidWildcard,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_name_parse() {
        assert!(TopicName::parse("foo").is_ok());
        assert!(TopicName::parse("foo/bar").is_ok());
        assert!(TopicName::parse("/").is_ok());
        assert!(TopicName::parse("///").is_ok());
        assert!(TopicName::parse("$SYS/uptime").is_ok());

        assert_eq!(TopicName::parse("").unwrap_err(), ParseError::Empty);
        assert_eq!(
            TopicName::parse("#").unwrap_err(),
            ParseError::UnexpectedCharacter { ch: '#', idx: 0 }
        );
        assert_eq!(
            TopicName::parse("foo/+").unwrap_err(),
            ParseError::UnexpectedCharacter { ch: '+', idx: 4 }
        );
        assert_eq!(
            TopicName::parse("foo\0").unwrap_err(),
            ParseError::UnexpectedCharacter { ch: '\0', idx: 3 }
        );
    }

    #[test]
    fn topic_name_display_round_trips() {
        for topic in ["/", "/foo/bar", "foo", "foo/bar", "foo/bar/", "///"] {
            assert_eq!(TopicName::parse(topic).unwrap().to_string(), topic);
        }
    }

    #[test]
    fn filter_parse() {
        for valid in ["a", "a/b", "+", "#", "a/+/b", "sport/#", "+/#", "/", "$SYS/#"] {
            valid.parse::<Filter>().unwrap_or_else(|e| {
                panic!("filter {valid:?} should parse: {e}");
            });
        }

        assert_eq!("".parse::<Filter>(), Err(FilterParseError::Empty));
        assert_eq!(
            "a/#/b".parse::<Filter>(),
            Err(FilterParseError::MultiLevelNotLast)
        );
        assert_eq!(
            "a/b+".parse::<Filter>(),
            Err(FilterParseError::InvalidWildcard)
        );
        assert_eq!(
            "a#".parse::<Filter>(),
            Err(FilterParseError::InvalidWildcard)
        );
        assert_eq!("a\0".parse::<Filter>(), Err(FilterParseError::NullByte));
    }

    #[track_caller]
    fn assert_match(filter: &str, topic: &str, expected: bool) {
        let filter: Filter = filter.parse().unwrap();
        let topic = TopicName::parse(topic).unwrap();

        assert_eq!(
            filter.matches(&topic),
            expected,
            "filter {filter} vs topic {topic}"
        );
    }

    #[test]
    fn reference_predicate() {
        assert_match("a/b", "a/b", true);
        assert_match("a/b", "a/c", false);
        assert_match("a/+", "a/b", true);
        assert_match("a/+", "a", false);
        assert_match("a/+", "a/b/c", false);

        // `sport/+` does not match `sport` but it does match `sport/`.
        assert_match("sport/+", "sport", false);
        assert_match("sport/+", "sport/", true);

        assert_match("sport/#", "sport", true);
        assert_match("sport/#", "sport/tennis", true);
        assert_match("sport/#", "sport/tennis/player1", true);
        assert_match("sport/#", "sports", false);
        assert_match("#", "anything/at/all", true);

        // `$`-topics are invisible to wildcards at the first level.
        assert_match("#", "$SYS/uptime", false);
        assert_match("+/uptime", "$SYS/uptime", false);
        assert_match("$SYS/#", "$SYS/uptime", true);
        assert_match("$SYS/uptime", "$SYS/uptime", true);
    }
}
