use super::StorageWriter;
use crate::device::{self, DeviceClass, DeviceTarget};

impl StorageWriter {
    /// Decide which key column addresses a device. Legacy-first precedence:
    /// an identifier reachable through both key columns is treated as
    /// legacy. New devices are classed by the naming convention of the
    /// attribute they published.
    pub(in crate::writer) async fn resolve_device(
        &self,
        device_id: &str,
        attribute: &str,
    ) -> Result<DeviceTarget, sqlx::Error> {
        let legacy: Option<i32> = sqlx::query_scalar("SELECT 1 FROM things WHERE swd_imei = $1")
            .bind(device_id)
            .fetch_optional(&self.pool)
            .await?;
        if legacy.is_some() {
            return Ok(DeviceTarget::Existing(DeviceClass::Legacy));
        }

        let current: Option<i32> = sqlx::query_scalar("SELECT 1 FROM things WHERE imei = $1")
            .bind(device_id)
            .fetch_optional(&self.pool)
            .await?;
        if current.is_some() {
            return Ok(DeviceTarget::Existing(DeviceClass::Current));
        }

        Ok(DeviceTarget::New(device::classify_new(attribute)))
    }
}
