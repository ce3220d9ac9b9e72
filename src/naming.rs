//! Default unit names.

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::collections::HashMap;

static NAME_COUNTS: Lazy<Mutex<HashMap<String, usize>>> = Lazy::new(|| Mutex::new(HashMap::new()));

/// `"Dense"` -> `"dense"`, `"LSTMCell"` -> `"lstm_cell"`.
pub fn to_snake_case(name: &str) -> String {
    let chars: Vec<char> = name.chars().collect();
    let mut out = String::with_capacity(name.len() + 4);
    for (i, &c) in chars.iter().enumerate() {
        if c.is_uppercase() {
            let prev_lower = i > 0 && (chars[i - 1].is_lowercase() || chars[i - 1].is_ascii_digit());
            let next_lower = chars.get(i + 1).is_some_and(|n| n.is_lowercase());
            let prev_upper = i > 0 && chars[i - 1].is_uppercase();
            if prev_lower || (prev_upper && next_lower) {
                out.push('_');
            }
            out.extend(c.to_lowercase());
        } else {
            out.push(c);
        }
    }
    out
}

/// Process-unique name derived from `base`: `base`, `base_1`, `base_2`, ...
pub fn unique_name(base: &str) -> String {
    let mut counts = NAME_COUNTS.lock();
    let n = counts.entry(base.to_string()).or_insert(0);
    let name = if *n == 0 {
        base.to_string()
    } else {
        format!("{}_{}", base, n)
    };
    *n += 1;
    name
}
