//! Lifecycle hook points and their execution policies.

use bitflags::bitflags;
use std::str::FromStr;
use strum::{AsRefStr, Display, EnumIter, EnumString};

#[derive(
    AsRefStr, Clone, Copy, Debug, Display, EnumIter, EnumString, Eq, Hash, PartialEq, PartialOrd, Ord,
)]
#[strum(serialize_all = "camelCase")]
/// The lifecycle moments at which the runtime (or the framework itself)
/// invokes the hook entry. The names match the `hooks[]` keys of the bundle.
pub enum HookPoint {
    /// Fired once per install by the framework, on the host.
    PostInstallation,

    /// Fired by the framework before the runtime's create, on the host.
    PreCreation,

    /// Fired by the runtime after namespace creation, before pivot_root.
    CreateRuntime,

    /// Fired by the runtime in the container mount namespace, host paths.
    CreateContainer,

    /// Fired by the runtime inside the container, before the user command.
    StartContainer,

    /// Fired by the runtime after the user process has been spawned.
    PostStart,

    /// Fired by the framework after the container has been signalled.
    PostHalt,

    /// Fired by the runtime after delete.
    PostStop,
}

bitflags! {
    /// Bitmask over the hook points a plugin participates in.
    pub struct HookMask: u32 {
        const POST_INSTALLATION = 0b00000001;
        const PRE_CREATION      = 0b00000010;
        const CREATE_RUNTIME    = 0b00000100;
        const CREATE_CONTAINER  = 0b00001000;
        const START_CONTAINER   = 0b00010000;
        const POST_START        = 0b00100000;
        const POST_HALT         = 0b01000000;
        const POST_STOP         = 0b10000000;
    }
}

impl HookPoint {
    /// The mask bit corresponding to this hook point.
    pub fn flag(self) -> HookMask {
        match self {
            HookPoint::PostInstallation => HookMask::POST_INSTALLATION,
            HookPoint::PreCreation => HookMask::PRE_CREATION,
            HookPoint::CreateRuntime => HookMask::CREATE_RUNTIME,
            HookPoint::CreateContainer => HookMask::CREATE_CONTAINER,
            HookPoint::StartContainer => HookMask::START_CONTAINER,
            HookPoint::PostStart => HookMask::POST_START,
            HookPoint::PostHalt => HookMask::POST_HALT,
            HookPoint::PostStop => HookMask::POST_STOP,
        }
    }

    /// Teardown hooks run their plugins in reverse dependency order.
    pub fn is_teardown(self) -> bool {
        matches!(self, HookPoint::PostHalt | HookPoint::PostStop)
    }

    /// Whether a plugin failure aborts the hook immediately. Teardown hooks
    /// and postStart run every plugin regardless and aggregate the failures.
    pub fn fail_fast(self) -> bool {
        !matches!(
            self,
            HookPoint::PostStart | HookPoint::PostHalt | HookPoint::PostStop
        )
    }

    /// Parse a hook name as it appears in the bundle's `hooks[]` array.
    pub fn parse(name: &str) -> Option<Self> {
        Self::from_str(name).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn names_round_trip() {
        for hook in HookPoint::iter() {
            assert_eq!(HookPoint::parse(hook.as_ref()), Some(hook));
        }
        assert_eq!(HookPoint::parse("createRuntime"), Some(HookPoint::CreateRuntime));
        assert_eq!(HookPoint::parse("noSuchHook"), None);
    }

    #[test]
    fn flags_are_distinct() {
        let mut seen = HookMask::empty();
        for hook in HookPoint::iter() {
            assert!(!seen.contains(hook.flag()));
            seen |= hook.flag();
        }
        assert_eq!(seen, HookMask::all());
    }

    #[test]
    fn policies() {
        assert!(HookPoint::CreateRuntime.fail_fast());
        assert!(!HookPoint::CreateRuntime.is_teardown());

        assert!(!HookPoint::PostStart.fail_fast());
        assert!(!HookPoint::PostStart.is_teardown());

        assert!(!HookPoint::PostHalt.fail_fast());
        assert!(HookPoint::PostHalt.is_teardown());
        assert!(HookPoint::PostStop.is_teardown());
    }
}
