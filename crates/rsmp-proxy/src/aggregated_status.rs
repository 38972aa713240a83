use serde_json::Value;

use crate::error::MessageError;

/// The eight aggregated status bits, in wire order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AggregatedFlag {
    LocalControl,
    CommunicationDisruption,
    HighPriorityAlarm,
    MediumPriorityAlarm,
    LowPriorityAlarm,
    Normal,
    Rest,
    NotConnected,
}

impl AggregatedFlag {
    pub const ALL: [AggregatedFlag; 8] = [
        AggregatedFlag::LocalControl,
        AggregatedFlag::CommunicationDisruption,
        AggregatedFlag::HighPriorityAlarm,
        AggregatedFlag::MediumPriorityAlarm,
        AggregatedFlag::LowPriorityAlarm,
        AggregatedFlag::Normal,
        AggregatedFlag::Rest,
        AggregatedFlag::NotConnected,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AggregatedFlag::LocalControl => "local_control",
            AggregatedFlag::CommunicationDisruption => "communication_disruption",
            AggregatedFlag::HighPriorityAlarm => "high_priority_alarm",
            AggregatedFlag::MediumPriorityAlarm => "medium_priority_alarm",
            AggregatedFlag::LowPriorityAlarm => "low_priority_alarm",
            AggregatedFlag::Normal => "normal",
            AggregatedFlag::Rest => "rest",
            AggregatedFlag::NotConnected => "not_connected",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AggregatedStatus {
    bits: [bool; 8],
    pub functional_position: Option<String>,
    pub functional_state: Option<String>,
}

impl AggregatedStatus {
    pub fn bits(&self) -> [bool; 8] {
        self.bits
    }

    pub fn is_set(&self, flag: AggregatedFlag) -> bool {
        self.bits[flag.index()]
    }

    pub fn flags(&self) -> Vec<AggregatedFlag> {
        AggregatedFlag::ALL
            .into_iter()
            .filter(|flag| self.is_set(*flag))
            .collect()
    }

    /// Set exactly `flags`; returns whether anything changed.
    pub fn set_flags(&mut self, flags: &[AggregatedFlag]) -> bool {
        let mut bits = [false; 8];
        for flag in flags {
            bits[flag.index()] = true;
        }
        self.set_bits(bits)
    }

    pub fn set_bits(&mut self, bits: [bool; 8]) -> bool {
        if self.bits == bits {
            return false;
        }
        self.bits = bits;
        true
    }

    /// Read the `se` attribute of an AggregatedStatus message.
    pub fn parse_se(value: &Value) -> Result<[bool; 8], MessageError> {
        let invalid = || MessageError::Invalid("se must be an array of 8 booleans".to_owned());
        let items = value.as_array().ok_or_else(invalid)?;
        if items.len() != 8 {
            return Err(invalid());
        }
        let mut bits = [false; 8];
        for (bit, item) in bits.iter_mut().zip(items) {
            *bit = item.as_bool().ok_or_else(invalid)?;
        }
        Ok(bits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn setting_same_flags_twice_reports_no_change() {
        let mut status = AggregatedStatus::default();
        assert!(status.set_flags(&[AggregatedFlag::Normal, AggregatedFlag::HighPriorityAlarm]));
        assert!(!status.set_flags(&[AggregatedFlag::HighPriorityAlarm, AggregatedFlag::Normal]));
        assert_eq!(
            status.bits(),
            [false, false, true, false, false, true, false, false]
        );
        assert_eq!(
            status.flags(),
            vec![AggregatedFlag::HighPriorityAlarm, AggregatedFlag::Normal]
        );
    }

    #[test]
    fn se_must_be_eight_booleans() {
        assert!(AggregatedStatus::parse_se(&json!(vec![false; 8])).is_ok());
        assert!(AggregatedStatus::parse_se(&json!(vec![false; 7])).is_err());
        assert!(
            AggregatedStatus::parse_se(&json!([true, false, false, false, false, false, false, "x"]))
                .is_err()
        );
        assert!(AggregatedStatus::parse_se(&json!("11110000")).is_err());
    }
}
