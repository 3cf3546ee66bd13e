use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// Stable target identifier (UUID v4, never reused).
pub type TargetId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MonitoringType {
    Url,
    Keyword,
    Topic,
    Arxiv,
    News,
}

impl MonitoringType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MonitoringType::Url => "url",
            MonitoringType::Keyword => "keyword",
            MonitoringType::Topic => "topic",
            MonitoringType::Arxiv => "arxiv",
            MonitoringType::News => "news",
        }
    }

    /// Listing types report each unseen item as its own change; only `url`
    /// targets are diffed against a document baseline.
    pub fn is_listing(&self) -> bool {
        !matches!(self, MonitoringType::Url)
    }
}

impl fmt::Display for MonitoringType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MonitoringType {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "url" => Ok(MonitoringType::Url),
            "keyword" => Ok(MonitoringType::Keyword),
            "topic" => Ok(MonitoringType::Topic),
            "arxiv" => Ok(MonitoringType::Arxiv),
            "news" => Ok(MonitoringType::News),
            other => Err(ValidationError::MonitoringType(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Medium => "medium",
            Priority::High => "high",
            Priority::Critical => "critical",
        }
    }

    /// How many times more often than its nominal frequency a target is checked.
    pub fn check_multiplier(&self) -> f64 {
        match self {
            Priority::Critical => 4.0,
            Priority::High => 2.0,
            Priority::Medium => 1.0,
            Priority::Low => 0.5,
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "low" => Ok(Priority::Low),
            "medium" => Ok(Priority::Medium),
            "high" => Ok(Priority::High),
            "critical" => Ok(Priority::Critical),
            other => Err(ValidationError::Priority(other.to_string())),
        }
    }
}

/// A configured thing to monitor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitoringTarget {
    pub id: TargetId,
    /// URL, keyword, topic or feed query.
    pub target: String,
    #[serde(rename = "type")]
    pub monitoring_type: MonitoringType,
    pub frequency_hours: f64,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub keywords: BTreeSet<String>,
    pub notification_threshold: f64,
    #[serde(default, rename = "last_checked")]
    pub last_checked_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Parameters for a target that has not been registered yet.
#[derive(Debug, Clone)]
pub struct NewTarget {
    pub target: String,
    pub monitoring_type: MonitoringType,
    pub frequency_hours: f64,
    pub priority: Priority,
    pub keywords: Vec<String>,
    pub notification_threshold: f64,
}

impl NewTarget {
    pub fn new(target: impl Into<String>, monitoring_type: MonitoringType) -> Self {
        Self {
            target: target.into(),
            monitoring_type,
            frequency_hours: 24.0,
            priority: Priority::Medium,
            keywords: Vec::new(),
            notification_threshold: 0.3,
        }
    }

    pub fn frequency_hours(mut self, hours: f64) -> Self {
        self.frequency_hours = hours;
        self
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn keywords<I, S>(mut self, keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.keywords = keywords.into_iter().map(Into::into).collect();
        self
    }

    pub fn threshold(mut self, threshold: f64) -> Self {
        self.notification_threshold = threshold;
        self
    }

    /// Check every invariant a registered target must hold.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.target.trim().is_empty() {
            return Err(ValidationError::EmptyTarget);
        }
        if !self.frequency_hours.is_finite() || self.frequency_hours <= 0.0 {
            return Err(ValidationError::Frequency(self.frequency_hours));
        }
        if !(0.0..=1.0).contains(&self.notification_threshold) {
            // NaN also lands here
            return Err(ValidationError::Threshold(self.notification_threshold));
        }
        Ok(())
    }

    /// Validate and turn into a registered target with a fresh id.
    pub fn into_target(self, created_at: DateTime<Utc>) -> Result<MonitoringTarget, ValidationError> {
        self.validate()?;
        let keywords = self
            .keywords
            .iter()
            .map(|k| k.trim())
            .filter(|k| !k.is_empty())
            .map(|k| k.to_string())
            .collect();
        Ok(MonitoringTarget {
            id: uuid::Uuid::new_v4().to_string(),
            target: self.target.trim().to_string(),
            monitoring_type: self.monitoring_type,
            frequency_hours: self.frequency_hours,
            priority: self.priority,
            keywords,
            notification_threshold: self.notification_threshold,
            last_checked_at: None,
            created_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_monitoring_type() {
        assert_eq!("ArXiv".parse::<MonitoringType>(), Ok(MonitoringType::Arxiv));
        assert_eq!(" url ".parse::<MonitoringType>(), Ok(MonitoringType::Url));
        assert_eq!(
            "rss".parse::<MonitoringType>(),
            Err(ValidationError::MonitoringType("rss".to_string()))
        );
    }

    #[test]
    fn test_parse_priority() {
        assert_eq!("CRITICAL".parse::<Priority>(), Ok(Priority::Critical));
        assert!("urgent".parse::<Priority>().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_frequency() {
        for hours in [0.0, -1.0, f64::NAN, f64::INFINITY] {
            let t = NewTarget::new("https://example.com", MonitoringType::Url).frequency_hours(hours);
            assert!(matches!(t.validate(), Err(ValidationError::Frequency(_))));
        }
    }

    #[test]
    fn test_validate_threshold_bounds() {
        let ok_low = NewTarget::new("ai", MonitoringType::Keyword).threshold(0.0);
        let ok_high = NewTarget::new("ai", MonitoringType::Keyword).threshold(1.0);
        assert!(ok_low.validate().is_ok());
        assert!(ok_high.validate().is_ok());

        for threshold in [-0.01, 1.01, f64::NAN] {
            let t = NewTarget::new("ai", MonitoringType::Keyword).threshold(threshold);
            assert!(matches!(t.validate(), Err(ValidationError::Threshold(_))));
        }
    }

    #[test]
    fn test_validate_empty_target() {
        let t = NewTarget::new("   ", MonitoringType::Topic);
        assert_eq!(t.validate(), Err(ValidationError::EmptyTarget));
    }

    #[test]
    fn test_into_target_normalizes_keywords() {
        let t = NewTarget::new(" rust ", MonitoringType::Keyword)
            .keywords(["AI", " AI ", "", "ML"])
            .into_target(Utc::now())
            .unwrap();
        assert_eq!(t.target, "rust");
        assert_eq!(t.keywords.len(), 2);
        assert!(t.keywords.contains("AI"));
        assert!(t.last_checked_at.is_none());
    }

    #[test]
    fn test_ids_are_unique() {
        let now = Utc::now();
        let a = NewTarget::new("x", MonitoringType::News).into_target(now).unwrap();
        let b = NewTarget::new("x", MonitoringType::News).into_target(now).unwrap();
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_config_field_names() {
        let t = NewTarget::new("https://example.com", MonitoringType::Url)
            .into_target(Utc::now())
            .unwrap();
        let json = serde_json::to_value(&t).unwrap();
        assert_eq!(json["type"], "url");
        assert_eq!(json["priority"], "medium");
        assert!(json.get("frequency_hours").is_some());
        assert!(json.get("last_checked").is_some());
    }
}
