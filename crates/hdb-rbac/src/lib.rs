//! # hdb-rbac: Role-based access control for `hdb`
//!
//! Provides the authorization side of the engine:
//! - **Roles** with `super_user`, `cluster_user`, `structure_user` flags or
//!   per-table grants with per-attribute overrides
//! - **Role validation** that itemizes every problem in submitted
//!   permission JSON
//! - **Permission evaluation** of access requests built by the query planner
//!   and mutation paths
//! - **Read masks** that silently hide attributes from `*` projections
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │  Operation (SQL / NoSQL / bulk job)          │
//! └─────────────────┬───────────────────────────┘
//!                   │ AccessRequest
//!                   ▼
//! ┌─────────────────────────────────────────────┐
//! │  PermissionEvaluator                         │
//! │  ├─ super_user-only operations               │
//! │  ├─ structure_user database scope            │
//! │  ├─ table grants  → unauthorized_access      │
//! │  └─ attribute grants → invalid_schema_items  │
//! └─────────────────┬───────────────────────────┘
//!                   │ Verdict + ReadMask
//!                   ▼
//! ┌─────────────────────────────────────────────┐
//! │  Executor / Mutation coordinator             │
//! └─────────────────────────────────────────────┘
//! ```
//!
//! ## Information hiding
//!
//! Attributes and tables a role may not see are reported with the same
//! not-found wording as items that really do not exist. Internally the two
//! cases are separate [`SchemaItemError`] variants.
//!
//! ## Example
//!
//! ```
//! use hdb_catalog::{AttributeDef, Catalog};
//! use hdb_rbac::{AccessRequest, Permission, PermissionEvaluator, Role, TableAccess, validate_permissions};
//! use hdb_types::TableRef;
//! use serde_json::json;
//!
//! let catalog = Catalog::new();
//! let dog = TableRef::new("dev", "dog");
//! catalog.create_table(&dog, "id", vec![AttributeDef::plain("age")]).unwrap();
//!
//! let permissions = validate_permissions(
//!     &json!({"dev": {"tables": {"dog": {
//!         "read": true, "insert": false, "update": false, "delete": false,
//!         "attribute_permissions": [
//!             {"attribute_name": "age", "read": false, "insert": false, "update": false}
//!         ]
//!     }}}}),
//!     &catalog,
//! ).unwrap();
//! let role = Role::new("1", "reader", permissions);
//!
//! let request = AccessRequest::data(
//!     "search_by_hash",
//!     [TableAccess::new(dog).require(Permission::Read).attribute("age", Permission::Read)],
//! );
//! let verdict = PermissionEvaluator::new(&role, &catalog).authorize(&request);
//! assert_eq!(
//!     verdict.invalid_schema_items[0].to_string(),
//!     "Attribute 'age' does not exist on 'dev.dog'"
//! );
//! ```

pub mod enforcement;
pub mod lookup;
pub mod mask;
pub mod permissions;
pub mod request;
pub mod validation;
pub mod verdict;

pub use enforcement::PermissionEvaluator;
pub use lookup::{AnySchema, SchemaLookup};
pub use mask::ReadMask;
pub use permissions::{
    AttributeGrant, AttributePermission, Permission, Role, RolePermissions, StructureUser,
    TablePermissions,
};
pub use request::{AccessRequest, TableAccess};
pub use validation::{RoleValidationError, validate_permissions};
pub use verdict::{
    AttributeDenial, SchemaItem, SchemaItemError, TableDenial, UNAUTHORIZED_MESSAGE,
    UnauthorizedAccess, Verdict,
};
