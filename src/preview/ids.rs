use rand::Rng;

use crate::ir::BranchKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinePrefix {
    Preview,
    Connection,
}

impl LinePrefix {
    fn as_str(self) -> &'static str {
        match self {
            Self::Preview => "preview",
            Self::Connection => "conn",
        }
    }
}

fn to_base36(mut value: u64) -> String {
    const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if value == 0 {
        return "0".to_string();
    }
    let mut out = Vec::new();
    while value > 0 {
        out.push(DIGITS[(value % 36) as usize]);
        value /= 36;
    }
    out.reverse();
    String::from_utf8(out).unwrap_or_default()
}

fn sanitize(part: &str) -> String {
    part.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect()
}

/// `{prefix}_{node}_{branch}_{timestamp}_{token}`.
///
/// The branch is part of the id, so lines created in the same millisecond for
/// sibling branches never collide, and the random token separates a line from
/// an earlier one recreated on the same branch.
pub fn line_id(prefix: LinePrefix, key: &BranchKey, now_ms: u64) -> String {
    let token: u64 = rand::rng().random_range(0..36_u64.pow(6));
    format!(
        "{}_{}_{}_{}_{}",
        prefix.as_str(),
        sanitize(&key.node_id),
        sanitize(key.branch_id.as_str()),
        now_ms,
        to_base36(token)
    )
}
