use std::collections::BTreeSet;
use std::time::SystemTime;

/// Credentials the check-in server assigns to this device. Zero means 'not assigned', and an
///  identity is only usable if both values are assigned.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash)]
pub struct DeviceIdentity {
    pub android_id: u64,
    pub security_token: u64,
}
impl DeviceIdentity {
    pub fn new(android_id: u64, security_token: u64) -> DeviceIdentity {
        DeviceIdentity {
            android_id,
            security_token,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.android_id != 0 && self.security_token != 0
    }
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct CheckinState {
    pub last_checkin_time: Option<SystemTime>,
    /// accounts that were sent with the most recent check-in request
    pub last_checkin_accounts: BTreeSet<String>,
    /// periodic check-ins are only scheduled once the set of accounts is known
    pub accounts_confirmed: bool,
}


#[cfg(test)]
mod tests {
    use rstest::rstest;
    use super::*;

    #[rstest]
    #[case::unassigned(0, 0, false)]
    #[case::no_token(5, 0, false)]
    #[case::no_id(0, 5, false)]
    #[case::assigned(1, 2, true)]
    fn test_is_valid(#[case] android_id: u64, #[case] security_token: u64, #[case] expected: bool) {
        assert_eq!(DeviceIdentity::new(android_id, security_token).is_valid(), expected);
    }
}
