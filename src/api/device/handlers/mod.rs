use diesel::ExpressionMethods;
use diesel::OptionalExtension;
use diesel::QueryDsl;
use diesel::SelectableHelper;
use diesel_async::{AsyncPgConnection, RunQueryDsl};

use crate::db::models::Device;

pub mod edge_gateway;
pub mod router;
pub mod vpn_container_client;

pub(crate) async fn find_device_by_serial(
    conn: &mut AsyncPgConnection,
    device_type_id: i32,
    serial: &str,
) -> Result<Option<Device>, diesel::result::Error> {
    use crate::db::schema::device::dsl::*;

    device
        .filter(device_type.eq(device_type_id))
        .filter(serial_number.eq(serial))
        .select(Device::as_select())
        .first(conn)
        .await
        .optional()
}

pub(crate) async fn find_device_by_uuid(
    conn: &mut AsyncPgConnection,
    device_type_id: i32,
    device_uuid: &str,
) -> Result<Option<Device>, diesel::result::Error> {
    use crate::db::schema::device::dsl::*;

    device
        .filter(device_type.eq(device_type_id))
        .filter(uuid.eq(device_uuid))
        .select(Device::as_select())
        .first(conn)
        .await
        .optional()
}
