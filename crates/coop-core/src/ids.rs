//! Integer id newtypes for ledger and catalog entities.
//!
//! Entities reference each other exclusively by id (no embedded object
//! graphs), so ownership and lifetime stay unambiguous across the store,
//! the engine, and the API layer. Ids are `SQLite` rowids.

use rusqlite::types::{FromSql, FromSqlResult, ToSqlOutput, ValueRef};
use rusqlite::ToSql;
use serde::{Deserialize, Serialize};

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub i64);

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<i64> for $name {
            fn from(raw: i64) -> Self {
                Self(raw)
            }
        }

        impl ToSql for $name {
            fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
                self.0.to_sql()
            }
        }

        impl FromSql for $name {
            fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
                i64::column_result(value).map(Self)
            }
        }
    };
}

id_type!(
    /// Identifies a farmer (owned by the accounts subsystem; opaque here).
    FarmerId
);
id_type!(
    /// Identifies a catalog subscription type.
    SubscriptionTypeId
);
id_type!(
    /// Identifies a catalog resource.
    ResourceId
);
id_type!(
    /// Identifies a farmer subscription ledger row.
    SubscriptionId
);
id_type!(
    /// Identifies a resource allocation row.
    AllocationId
);
id_type!(
    /// Identifies a payment record.
    PaymentId
);
