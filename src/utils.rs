use serde::Serialize;

/// Serialize a serde-backed enum into its string name (e.g. `heat_cool`).
pub fn serde_enum_name<T: Serialize>(val: &T) -> Option<String> {
    serde_json::to_value(val).ok()?.as_str().map(|s| s.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::climate::{FanMode, HvacMode};

    #[test]
    fn names_unit_variants() {
        assert_eq!(serde_enum_name(&HvacMode::HeatCool).as_deref(), Some("heat_cool"));
        assert_eq!(serde_enum_name(&FanMode::Medium).as_deref(), Some("medium"));
        assert_eq!(serde_enum_name(&42), None);
    }
}
