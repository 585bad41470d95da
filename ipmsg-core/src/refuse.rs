//! Refuse filter: peers matching any rule are kept out of the directory and never answered.

use std::net::IpAddr;

use serde::Deserialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RefuseTarget {
    /// Display name.
    User,
    Group,
    /// Machine name.
    Host,
    Login,
    Address,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RefuseCondition {
    Match,
    Contain,
    Start,
    End,
}

/// One rule. Comparison is case-insensitive.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RefuseRule {
    pub target: RefuseTarget,
    pub condition: RefuseCondition,
    pub pattern: String,
}

/// Fields of an announcing peer that rules can match against.
#[derive(Debug, Clone, Copy)]
pub struct RefuseSubject<'a> {
    pub user_name: &'a str,
    pub group_name: &'a str,
    pub host_name: &'a str,
    pub login_name: &'a str,
    pub address: IpAddr,
}

impl RefuseRule {
    pub fn new(target: RefuseTarget, condition: RefuseCondition, pattern: impl Into<String>) -> Self {
        Self {
            target,
            condition,
            pattern: pattern.into(),
        }
    }

    pub fn matches(&self, subject: &RefuseSubject<'_>) -> bool {
        if self.pattern.is_empty() {
            return false;
        }
        let address;
        let value = match self.target {
            RefuseTarget::User => subject.user_name,
            RefuseTarget::Group => subject.group_name,
            RefuseTarget::Host => subject.host_name,
            RefuseTarget::Login => subject.login_name,
            RefuseTarget::Address => {
                address = subject.address.to_string();
                address.as_str()
            }
        };
        let value = value.to_lowercase();
        let pattern = self.pattern.to_lowercase();
        match self.condition {
            RefuseCondition::Match => value == pattern,
            RefuseCondition::Contain => value.contains(&pattern),
            RefuseCondition::Start => value.starts_with(&pattern),
            RefuseCondition::End => value.ends_with(&pattern),
        }
    }
}

pub fn is_refused(rules: &[RefuseRule], subject: &RefuseSubject<'_>) -> bool {
    rules.iter().any(|r| r.matches(subject))
}
