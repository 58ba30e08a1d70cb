//! Device quirks table.
//!
//! Ported verbatim from the source firmware's `quirks.c` built-in table.
//! Lookup is manufacturer-exact, model-exact-or-prefix, first hit wins;
//! actions within an entry apply in declaration order.

use crate::model::{CapValue, Capability};

#[derive(Debug, Clone, Copy)]
pub enum QuirkAction {
  ClampRange { target: Capability, min: i32, max: i32 },
  InvertBoolean { target: Capability },
  ScaleNumeric { target: Capability, multiplier: f32, offset: f32 },
}

impl QuirkAction {
  fn target(&self) -> Capability {
    match *self {
      QuirkAction::ClampRange { target, .. } => target,
      QuirkAction::InvertBoolean { target } => target,
      QuirkAction::ScaleNumeric { target, .. } => target,
    }
  }

  /// Forward transform, applied to inbound attribute reports.
  fn apply_forward(&self, value: &mut CapValue) {
    match *self {
      QuirkAction::ClampRange { min, max, .. } => {
        if let CapValue::Int(i) = value {
          *i = (*i).clamp(min, max);
        }
      }
      QuirkAction::InvertBoolean { .. } => {
        if let CapValue::Bool(b) = value {
          *b = !*b;
        }
      }
      QuirkAction::ScaleNumeric { multiplier, offset, .. } => {
        if let CapValue::Float(f) = value {
          *f = *f * multiplier + offset;
        }
      }
    }
  }

  /// Inverse transform, applied to outbound commands: clamp and invert are
  /// self-inverse; scale reverses `(v - off) / mul` when `|mul| > epsilon`,
  /// else is the identity.
  fn apply_inverse(&self, value: &mut CapValue) {
    const EPSILON: f32 = 1e-6;
    match *self {
      QuirkAction::ClampRange { min, max, .. } => {
        if let CapValue::Int(i) = value {
          *i = (*i).clamp(min, max);
        }
      }
      QuirkAction::InvertBoolean { .. } => {
        if let CapValue::Bool(b) = value {
          *b = !*b;
        }
      }
      QuirkAction::ScaleNumeric { multiplier, offset, .. } => {
        if let CapValue::Float(f) = value {
          if multiplier.abs() > EPSILON {
            *f = (*f - offset) / multiplier;
          }
        }
      }
    }
  }
}

pub struct Quirk {
  pub manufacturer: &'static str,
  pub model: &'static str,
  pub prefix_match: bool,
  pub actions: &'static [QuirkAction],
}

pub static QUIRKS_TABLE: &[Quirk] = &[
  Quirk {
    manufacturer: "DUMMY",
    model: "DUMMY-LIGHT-1",
    prefix_match: false,
    actions: &[QuirkAction::ClampRange { target: Capability::LightLevel, min: 1, max: 100 }],
  },
  Quirk {
    manufacturer: "IKEA of Sweden",
    model: "TRADFRI bulb",
    prefix_match: true,
    actions: &[QuirkAction::ClampRange { target: Capability::LightLevel, min: 1, max: 100 }],
  },
  Quirk {
    manufacturer: "LUMI",
    model: "lumi.sensor_magnet",
    prefix_match: true,
    actions: &[QuirkAction::InvertBoolean { target: Capability::SensorContact }],
  },
  Quirk {
    manufacturer: "_TZE200",
    model: "TS0601",
    prefix_match: true,
    actions: &[QuirkAction::ScaleNumeric { target: Capability::SensorTemperature, multiplier: 0.1, offset: 0.0 }],
  },
];

pub fn find(manufacturer: &str, model: &str) -> Option<&'static Quirk> {
  QUIRKS_TABLE.iter().find(|q| {
    if q.manufacturer != manufacturer {
      return false;
    }
    if q.prefix_match {
      model.starts_with(q.model)
    } else {
      model == q.model
    }
  })
}

/// Applies every action in `quirk` targeting `cap`, in declaration order, to
/// an inbound report value.
pub fn apply_value(quirk: &Quirk, cap: Capability, value: &mut CapValue) -> bool {
  let mut applied = false;
  for action in quirk.actions.iter().filter(|a| a.target() == cap) {
    action.apply_forward(value);
    applied = true;
  }
  applied
}

/// Applies the inverse of every action in `quirk` targeting `cap`, in
/// declaration order, to an outbound command value.
pub fn apply_command(quirk: &Quirk, cap: Capability, value: &mut CapValue) -> bool {
  let mut applied = false;
  for action in quirk.actions.iter().filter(|a| a.target() == cap) {
    action.apply_inverse(value);
    applied = true;
  }
  applied
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn exact_match_finds_dummy_light() {
    let q = find("DUMMY", "DUMMY-LIGHT-1").unwrap();
    assert_eq!(q.actions.len(), 1);
  }

  #[test]
  fn prefix_match_finds_tradfri_variant() {
    let q = find("IKEA of Sweden", "TRADFRI bulb E27 WS opal 980lm").unwrap();
    assert_eq!(q.manufacturer, "IKEA of Sweden");
  }

  #[test]
  fn unknown_device_has_no_quirk() {
    assert!(find("Acme", "Widget").is_none());
  }

  #[test]
  fn clamp_range_saturates_light_level() {
    let q = find("DUMMY", "DUMMY-LIGHT-1").unwrap();
    let mut v = CapValue::Int(250);
    assert!(apply_value(q, Capability::LightLevel, &mut v));
    assert_eq!(v, CapValue::Int(100));
    let mut v = CapValue::Int(0);
    apply_value(q, Capability::LightLevel, &mut v);
    assert_eq!(v, CapValue::Int(1));
  }

  #[test]
  fn invert_boolean_flips_contact() {
    let q = find("LUMI", "lumi.sensor_magnet").unwrap();
    let mut v = CapValue::Bool(true);
    apply_value(q, Capability::SensorContact, &mut v);
    assert_eq!(v, CapValue::Bool(false));
  }

  #[test]
  fn scale_numeric_forward_and_inverse_round_trip() {
    let q = find("_TZE200", "TS0601").unwrap();
    let mut v = CapValue::Float(215.0);
    apply_value(q, Capability::SensorTemperature, &mut v);
    assert_eq!(v, CapValue::Float(21.5));
    apply_command(q, Capability::SensorTemperature, &mut v);
    assert!((v.as_float().unwrap() - 215.0).abs() < 1e-3);
  }

  #[test]
  fn quirk_action_not_targeting_cap_is_skipped() {
    let q = find("DUMMY", "DUMMY-LIGHT-1").unwrap();
    let mut v = CapValue::Bool(true);
    assert!(!apply_value(q, Capability::SwitchOn, &mut v));
    assert_eq!(v, CapValue::Bool(true));
  }
}
