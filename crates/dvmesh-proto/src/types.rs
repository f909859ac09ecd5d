//! Telegram type registry.
//!
//! Every telegram starts with a one-byte type code selecting its payload
//! schema. Codes 1–19 are used between applications and their
//! distributor, 65–87 between distributors.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Delivery precedence on a link. Higher classes are sent first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum PriorityClass {
    /// Application records
    Data,
    /// Subscription, resolution, routing and interest-list control
    Routing,
    /// Link management: handshake, keep-alive, termination, time probes
    System,
}

macro_rules! telegram_types {
    ($($variant:ident = $code:literal, $name:literal, $class:ident;)+) => {
        /// Registered telegram type.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[repr(u8)]
        pub enum TelegramType {
            $(
                #[doc = $name]
                $variant = $code,
            )+
        }

        impl TelegramType {
            /// Every registered type, ordered by code.
            pub const ALL: &'static [TelegramType] = &[$(TelegramType::$variant),+];

            /// Look up a type code.
            #[must_use]
            pub const fn from_code(code: u8) -> Option<Self> {
                match code {
                    $($code => Some(TelegramType::$variant),)+
                    _ => None,
                }
            }

            /// Human-readable name.
            #[must_use]
            pub const fn name(self) -> &'static str {
                match self {
                    $(TelegramType::$variant => $name,)+
                }
            }

            /// Priority class on the link.
            #[must_use]
            pub const fn priority(self) -> PriorityClass {
                match self {
                    $(TelegramType::$variant => PriorityClass::$class,)+
                }
            }
        }
    };
}

telegram_types! {
    ProtocolVersionRequest = 1, "protocol version request", System;
    ProtocolVersionAnswer = 2, "protocol version answer", System;
    AuthenticationTextRequest = 3, "authentication text request", System;
    AuthenticationTextAnswer = 4, "authentication text answer", System;
    AuthenticationRequest = 5, "authentication request", System;
    AuthenticationAnswer = 6, "authentication answer", System;
    ConnectionParametersRequest = 7, "connection parameters request", System;
    ConnectionParametersAnswer = 8, "connection parameters answer", System;
    Terminate = 9, "terminate", System;
    Closing = 10, "closing", System;
    RequestSenderData = 11, "request sender data", Routing;
    TelegramTimeRequest = 12, "telegram time request", System;
    TelegramTimeAnswer = 13, "telegram time answer", System;
    KeepAlive = 14, "keep-alive", System;
    SendSubscription = 15, "send subscription", Routing;
    ReceiveSubscription = 16, "receive subscription", Routing;
    SendUnsubscription = 17, "send unsubscription", Routing;
    ReceiveUnsubscription = 18, "receive unsubscription", Routing;
    ApplicationData = 19, "application data", Data;
    DistributorVersionRequest = 65, "distributor protocol version request", System;
    DistributorVersionAnswer = 66, "distributor protocol version answer", System;
    DistributorAuthenticationTextRequest = 67, "distributor authentication text request", System;
    DistributorAuthenticationTextAnswer = 68, "distributor authentication text answer", System;
    DistributorAuthenticationRequest = 69, "distributor authentication request", System;
    DistributorAuthenticationAnswer = 70, "distributor authentication answer", System;
    DistributorConnectionParametersRequest = 71, "distributor connection parameters request", System;
    DistributorConnectionParametersAnswer = 72, "distributor connection parameters answer", System;
    DistributorTerminate = 73, "distributor terminate", System;
    DistributorClosing = 74, "distributor closing", System;
    DistributorTelegramTimeRequest = 75, "distributor telegram time request", System;
    DistributorTelegramTimeAnswer = 76, "distributor telegram time answer", System;
    DistributorKeepAlive = 77, "distributor keep-alive", System;
    DataSubscription = 78, "data subscription", Routing;
    DataSubscriptionReceipt = 79, "data subscription receipt", Routing;
    DataUnsubscription = 80, "data unsubscription", Routing;
    TransmitterData = 81, "distributor data", Data;
    BestPathUpdate = 82, "best path update", Routing;
    InterestSubscription = 83, "interest list subscription", Routing;
    InterestUnsubscription = 84, "interest list unsubscription", Routing;
    InterestDeliveryUnsubscription = 85, "interest list delivery unsubscription", Routing;
    InterestUpdate = 86, "interest list update", Routing;
    InterestResyncRequest = 87, "interest list full resync request", Routing;
}

impl TelegramType {
    /// Wire code.
    #[must_use]
    pub const fn code(self) -> u8 {
        self as u8
    }

    /// Whether the type is only used between distributors.
    #[must_use]
    pub const fn is_distributor(self) -> bool {
        self.code() >= 65
    }
}

impl fmt::Display for TelegramType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name(), self.code())
    }
}
