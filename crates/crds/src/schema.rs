//! Schema overrides for embedded Kubernetes core types.
//!
//! Pod templates and persistent volume specs are validated by the API server
//! when the derived objects are created, so the CRD only declares them as
//! free-form objects.

use schemars::{json_schema, Schema, SchemaGenerator};

pub(crate) fn preserve_unknown_fields(_: &mut SchemaGenerator) -> Schema {
    json_schema!({
        "type": "object",
        "x-kubernetes-preserve-unknown-fields": true
    })
}
