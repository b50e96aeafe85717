// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/// The public error taxonomy, exactly the kinds enumerated in `spec.md` §6.
///
/// Grounded on `drv/i2c-api`'s `ResponseCode` (a flat, `Display`-able error
/// enum returned from every fallible operation) without the Idol/IPC
/// marshalling baggage, since principals here are in-process handlers, not
/// messages crossing a syscall boundary.
#[derive(Copy, Clone, Debug, Eq, PartialEq, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    #[error("runtime is not initialized")]
    NotInitialized,
    #[error("runtime is already initialized")]
    AlreadyInitialized,
    #[error("secure key does not match the run's integrity token")]
    InvalidSecureKey,
    #[error("service not found")]
    ServiceNotFound,
    #[error("service registry is full")]
    ServiceRegistryFull,
    #[error("service already registered")]
    ServiceAlreadyRegistered,
    #[error("event type registry is full")]
    EventTypeRegistryFull,
    #[error("event type not found")]
    EventTypeNotFound,
    #[error("event queue is full")]
    EventQueueFull,
    #[error("event payload exceeds the maximum size")]
    EventDataTooLarge,
    #[error("subscription table is full")]
    SubscriptionFull,
    #[error("subscription not found")]
    SubscriptionNotFound,
    #[error("event-rate quota exceeded")]
    QuotaEventsExceeded,
    #[error("subscription quota exceeded")]
    QuotaSubscriptionsExceeded,
    #[error("payload size quota exceeded")]
    QuotaDataSizeExceeded,
    #[error("dependency edge would introduce a cycle")]
    CircularDependency,
    #[error("a declared dependency failed to initialize")]
    DependencyFailed,
    #[error("watchdog detected a stale heartbeat")]
    WatchdogTimeout,
    #[error("restart attempt failed")]
    RestartFailed,
    #[error("handler exceeded its timeout")]
    HandlerTimeout,
    #[error("application context is invalid or already torn down")]
    AppContextInvalid,
    #[error("application manifest is invalid or incompatible")]
    AppInvalidManifest,
    #[error("out of memory")]
    OutOfMemory,
    #[error("operation timed out")]
    Timeout,
}

impl Error {
    /// Human-readable, stable name for this error kind.
    ///
    /// Grounded on `original_source`'s `system_service_err_to_name()`, which
    /// the C original exposes for diagnostic logging; kept here for the same
    /// purpose rather than relying on `Display`'s prose, which may change.
    pub const fn kind_name(&self) -> &'static str {
        match self {
            Error::NotInitialized => "NotInitialized",
            Error::AlreadyInitialized => "AlreadyInitialized",
            Error::InvalidSecureKey => "InvalidSecureKey",
            Error::ServiceNotFound => "ServiceNotFound",
            Error::ServiceRegistryFull => "ServiceRegistryFull",
            Error::ServiceAlreadyRegistered => "ServiceAlreadyRegistered",
            Error::EventTypeRegistryFull => "EventTypeRegistryFull",
            Error::EventTypeNotFound => "EventTypeNotFound",
            Error::EventQueueFull => "EventQueueFull",
            Error::EventDataTooLarge => "EventDataTooLarge",
            Error::SubscriptionFull => "SubscriptionFull",
            Error::SubscriptionNotFound => "SubscriptionNotFound",
            Error::QuotaEventsExceeded => "QuotaEventsExceeded",
            Error::QuotaSubscriptionsExceeded => "QuotaSubscriptionsExceeded",
            Error::QuotaDataSizeExceeded => "QuotaDataSizeExceeded",
            Error::CircularDependency => "CircularDependency",
            Error::DependencyFailed => "DependencyFailed",
            Error::WatchdogTimeout => "WatchdogTimeout",
            Error::RestartFailed => "RestartFailed",
            Error::HandlerTimeout => "HandlerTimeout",
            Error::AppContextInvalid => "AppContextInvalid",
            Error::AppInvalidManifest => "AppInvalidManifest",
            Error::OutOfMemory => "OutOfMemory",
            Error::Timeout => "Timeout",
        }
    }

    /// True for errors that are local recoveries rather than caller-visible
    /// failures of intent; see `spec.md` §7's error handling policy.
    pub const fn is_quota_violation(&self) -> bool {
        matches!(
            self,
            Error::QuotaEventsExceeded
                | Error::QuotaSubscriptionsExceeded
                | Error::QuotaDataSizeExceeded
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_name_matches_variant() {
        assert_eq!(Error::QuotaEventsExceeded.kind_name(), "QuotaEventsExceeded");
        assert_eq!(Error::CircularDependency.kind_name(), "CircularDependency");
    }

    #[test]
    fn quota_violation_classification() {
        assert!(Error::QuotaDataSizeExceeded.is_quota_violation());
        assert!(!Error::ServiceNotFound.is_quota_violation());
    }
}
