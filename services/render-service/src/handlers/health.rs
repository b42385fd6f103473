/// Liveness probe (§6): a separate `/health` endpoint on the RS, distinct
/// from the EG's, per the external-interfaces section.
pub async fn health() -> &'static str {
    "ok"
}
