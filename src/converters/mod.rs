mod json;

pub use json::{json_to_row, json_to_value, value_to_json};
