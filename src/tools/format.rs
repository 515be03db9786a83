//! Log-friendly renderings of SQL text and durations.
//!
//! `short_sql` squeezes an arbitrary statement into a single line of at most
//! 75 characters, keeping the interesting part of each of the SELECT, FROM
//! and WHERE clauses. `human_duration` prints elapsed times the way they are
//! read in trace output.

use std::time::Duration;

/// Total character budget of a shortened statement.
pub const SHORT_SQL_MAX_LENGTH: usize = 75;

const SELECT_BUDGET: usize = SHORT_SQL_MAX_LENGTH * 3 / 10;
const FROM_BUDGET: usize = SHORT_SQL_MAX_LENGTH * 4 / 10;

/// Rendering used for an empty statement.
pub const EMPTY_SQL_MARKER: &str = "---";

const ELLIPSIS: char = '…';

/// Render SQL as a single line of at most 75 characters.
///
/// Newlines and bracket quoting are removed and runs of spaces collapsed.
/// A statement that is not a SELECT near its start (or has no FROM clause)
/// is cut at the budget. Otherwise the SELECT list, the FROM clause and the
/// WHERE clause are truncated independently, skipping any sub-select inside
/// the column list when locating the outer FROM.
pub fn short_sql(sql: &str) -> String {
    if sql.is_empty() {
        return EMPTY_SQL_MARKER.to_string();
    }

    let stripped: String = sql
        .chars()
        .filter(|c| !matches!(c, '\n' | '\r' | '[' | ']'))
        .collect();
    let collapsed = stripped
        .split(' ')
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join(" ");
    let chars: Vec<char> = collapsed.chars().collect();

    let select_position = find_keyword(&chars, "SELECT", 0);
    let mut from_position = find_keyword(&chars, "FROM", 0);

    if let Some(select_at) = select_position {
        let mut next = find_keyword(&chars, "SELECT", select_at + 1);
        while let Some(nested) = next {
            if let Some(from_at) = from_position.filter(|&from_at| nested < from_at) {
                from_position = find_keyword(&chars, "FROM", from_at + 1);
            }
            next = find_keyword(&chars, "SELECT", nested + 1);
        }
    }

    let (select_at, from_at) = match (select_position, from_position) {
        (Some(select_at), Some(from_at)) if select_at <= 5 && from_at > select_at => {
            (select_at, from_at)
        }
        _ => return truncate_plain(&chars),
    };

    let (select_part, select_len) = clip_clause(&chars[select_at..from_at], SELECT_BUDGET);

    let where_position = find_keyword(&chars, "WHERE", from_at);
    let from_end = where_position.unwrap_or(chars.len());
    let (from_part, from_len) = clip_clause(&chars[from_at..from_end], FROM_BUDGET);

    let where_chars = where_position.map(|at| &chars[at..]).unwrap_or(&[]);
    let where_budget = SHORT_SQL_MAX_LENGTH.saturating_sub(select_len + from_len);
    let where_part = if where_chars.len() > where_budget {
        let keep = where_budget.saturating_sub(1);
        let mut clipped: String = where_chars[..keep].iter().collect();
        clipped.push(ELLIPSIS);
        clipped
    } else {
        where_chars.iter().collect()
    };

    format!("{select_part}{from_part}{where_part}")
}

/// Truncate a clause to `budget` characters, counting the elision as two.
fn clip_clause(clause: &[char], budget: usize) -> (String, usize) {
    if clause.len() > budget {
        let mut clipped: String = clause[..budget - 2].iter().collect();
        clipped.push(ELLIPSIS);
        clipped.push(' ');
        (clipped, budget)
    } else {
        (clause.iter().collect(), clause.len())
    }
}

fn truncate_plain(chars: &[char]) -> String {
    if chars.len() > SHORT_SQL_MAX_LENGTH {
        let mut clipped: String = chars[..SHORT_SQL_MAX_LENGTH - 1].iter().collect();
        clipped.push(ELLIPSIS);
        clipped
    } else {
        chars.iter().collect()
    }
}

/// Case-insensitive search for an ASCII keyword, starting at `start`.
fn find_keyword(haystack: &[char], keyword: &str, start: usize) -> Option<usize> {
    let needle: Vec<char> = keyword.chars().collect();
    if needle.len() > haystack.len() {
        return None;
    }
    (start..=haystack.len() - needle.len()).find(|&at| {
        haystack[at..at + needle.len()]
            .iter()
            .zip(&needle)
            .all(|(h, n)| h.eq_ignore_ascii_case(n))
    })
}

/// Render a duration for log output.
///
/// | Range | Example |
/// |---|---|
/// | zero | `0` |
/// | under 10 ms | `3.455 ms` |
/// | under 1 s | `383 ms` |
/// | a minute or more | `1 min 34 sec` |
/// | under 10 s | `6 sec 372 ms` |
/// | otherwise | `11 sec` |
pub fn human_duration(elapsed: Duration) -> String {
    if elapsed.is_zero() {
        return "0".to_string();
    }

    let nanos = elapsed.as_nanos();
    if nanos < 10_000_000 {
        let micros = (nanos + 500) / 1_000;
        let (whole, fraction) = (micros / 1_000, micros % 1_000);
        if fraction == 0 {
            return format!("{whole} ms");
        }
        let fraction = format!("{fraction:03}");
        return format!("{whole}.{} ms", fraction.trim_end_matches('0'));
    }

    if nanos < 1_000_000_000 {
        return format!("{} ms", (nanos + 500_000) / 1_000_000);
    }

    let total_secs = elapsed.as_secs();
    let minutes = (total_secs / 60) % 60;
    let seconds = total_secs % 60;
    if minutes > 0 {
        return format!("{minutes} min {seconds} sec");
    }

    if total_secs < 10 {
        return format!("{seconds} sec {} ms", elapsed.subsec_millis());
    }

    format!("{seconds} sec")
}
