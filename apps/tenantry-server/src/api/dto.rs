use serde::{Deserialize, Serialize};
use tenantry_db::descriptor::DescriptorSummary;
use tenantry_db::{Engine, ExecOutcome, RawDescriptor, RawStatement, StructuredOp};

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestConnectionRequest {
    #[serde(default)]
    pub db_config: Option<RawDescriptor>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryRequest {
    #[serde(default)]
    pub db_config: Option<RawDescriptor>,
    pub operation: StructuredOp,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawRequest {
    #[serde(default)]
    pub db_config: Option<RawDescriptor>,
    pub statement: RawStatement,
}

#[derive(Debug, Serialize)]
pub struct TestConnectionResponse {
    pub success: bool,
    pub connected: bool,
    #[serde(flatten)]
    pub descriptor: DescriptorSummary,
}

#[derive(Debug, Serialize)]
pub struct ExecResponse {
    pub success: bool,
    #[serde(rename = "type")]
    pub engine: Engine,
    #[serde(flatten)]
    pub outcome: ExecOutcome,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub cached_pools: usize,
}

/// Failure body shared by every route.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub error: String,
    pub code: &'static str,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub engine: Option<Engine>,
}
