//! 权限模型
//!
//! 权限字符串格式为 `resource:action`，两段都必须匹配 `[a-z][a-z0-9_]*`，
//! 其中 action 还可以是通配符 `*`。单独的 `*` 表示全局权限。
//! 字符串只在授予/请求时解析一次，检查时只做模式匹配。

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use lms_error::{LmsError, Result};
use serde::{Deserialize, Serialize};

pub const WILDCARD: &str = "*";

/// 校验标识符片段：小写字母开头，后续为小写字母、数字或下划线
pub fn is_valid_segment(segment: &str) -> bool {
    let mut chars = segment.chars();
    match chars.next() {
        Some(first) if first.is_ascii_lowercase() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

/// 权限模式
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum PermissionPattern {
    /// `*`
    Global,
    /// `resource:*`
    ActionWildcard { resource: String },
    /// `resource:action`
    Exact { resource: String, action: String },
}

impl PermissionPattern {
    pub fn parse(input: &str) -> Result<Self> {
        let invalid = |message: &str| LmsError::validation("permission", format!("{}: '{}'", message, input));

        if input == WILDCARD {
            return Ok(Self::Global);
        }

        let (resource, action) = input
            .split_once(':')
            .ok_or_else(|| invalid("expected resource:action"))?;

        if !is_valid_segment(resource) {
            return Err(invalid("invalid resource segment"));
        }

        if action == WILDCARD {
            return Ok(Self::ActionWildcard {
                resource: resource.to_string(),
            });
        }

        if !is_valid_segment(action) {
            return Err(invalid("invalid action segment"));
        }

        Ok(Self::Exact {
            resource: resource.to_string(),
            action: action.to_string(),
        })
    }

    /// 当前持有的模式是否满足请求的权限
    ///
    /// 全局 `*` 满足一切；`resource:*` 满足同一资源下的任意请求；
    /// 其余情况必须字面相等。不支持 `*:action` 形式的资源通配。
    pub fn satisfies(&self, requested: &PermissionPattern) -> bool {
        match (self, requested) {
            (Self::Global, _) => true,
            (Self::ActionWildcard { resource: held }, Self::Exact { resource, .. })
            | (Self::ActionWildcard { resource: held }, Self::ActionWildcard { resource }) => {
                held == resource
            }
            (held, requested) => held == requested,
        }
    }
}

impl fmt::Display for PermissionPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Global => f.write_str(WILDCARD),
            Self::ActionWildcard { resource } => write!(f, "{}:{}", resource, WILDCARD),
            Self::Exact { resource, action } => write!(f, "{}:{}", resource, action),
        }
    }
}

impl FromStr for PermissionPattern {
    type Err = LmsError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for PermissionPattern {
    type Error = LmsError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<PermissionPattern> for String {
    fn from(value: PermissionPattern) -> Self {
        value.to_string()
    }
}

/// 有效权限集合：角色权限与个人权限的并集（派生数据，不落库）
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EffectivePermissionSet {
    patterns: HashSet<PermissionPattern>,
}

impl EffectivePermissionSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend<I>(&mut self, patterns: I)
    where
        I: IntoIterator<Item = PermissionPattern>,
    {
        self.patterns.extend(patterns);
    }

    pub fn satisfies(&self, requested: &PermissionPattern) -> bool {
        // 先做精确命中，再回退到通配符扫描
        self.patterns.contains(requested) || self.patterns.iter().any(|held| held.satisfies(requested))
    }

    pub fn contains(&self, pattern: &PermissionPattern) -> bool {
        self.patterns.contains(pattern)
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PermissionPattern> {
        self.patterns.iter()
    }

    /// 排序后的字符串列表，便于序列化输出
    pub fn to_sorted_strings(&self) -> Vec<String> {
        let mut items: Vec<String> = self.patterns.iter().map(ToString::to_string).collect();
        items.sort();
        items
    }
}

impl FromIterator<PermissionPattern> for EffectivePermissionSet {
    fn from_iter<I: IntoIterator<Item = PermissionPattern>>(iter: I) -> Self {
        Self {
            patterns: iter.into_iter().collect(),
        }
    }
}
