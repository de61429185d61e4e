use std::collections::HashMap;

use bluer::Address;

use crate::native::NativePeripheral;

/// Reads the advertisement BlueZ has cached for the device at `address`.
pub(super) async fn peripheral(adapter: &bluer::Adapter, address: Address) -> bluer::Result<NativePeripheral> {
    let device = adapter.device(address)?;

    let service_uuids = device
        .uuids()
        .await?
        .unwrap_or_default()
        .into_iter()
        .map(|x| x.to_string())
        .collect();

    let service_data = device
        .service_data()
        .await?
        .unwrap_or_default()
        .into_iter()
        .map(|(uuid, data)| (uuid.to_string(), data))
        .collect();

    let manufacturer_data = encode_manufacturer_data(device.manufacturer_data().await?.unwrap_or_default());

    Ok(NativePeripheral {
        id: address.to_string(),
        address: Some(address.to_string()),
        local_name: device.name().await?,
        service_uuids,
        service_data,
        manufacturer_data,
        rssi: device.rssi().await?,
        tx_power_level: device.tx_power().await?,
    })
}

/// Re-encodes the entry with the lowest company identifier as it appears on air: the little-endian identifier
/// followed by the payload.
fn encode_manufacturer_data(data: HashMap<u16, Vec<u8>>) -> Option<Vec<u8>> {
    data.into_iter().min_by_key(|(company, _)| *company).map(|(company, payload)| {
        let mut raw = company.to_le_bytes().to_vec();
        raw.extend(payload);
        raw
    })
}
