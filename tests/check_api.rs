#![allow(clippy::let_unit_value)]

use futures_lite::StreamExt;
use webble::btuuid::bluetooth_uuid_from_u16;
use webble::*;

fn assert_send<T: Send>(t: T) -> T {
    t
}

async fn check_bluetooth_apis(backend: Backend) -> Result<Device> {
    let bluetooth: Result<Bluetooth> = assert_send(Bluetooth::new(backend, BluetoothOptions::default())).await;
    let bluetooth = bluetooth?;

    let _available: bool = assert_send(bluetooth.get_availability()).await;
    let _adapters: Result<Vec<AdapterInfo>> = assert_send(bluetooth.adapters()).await;
    let _res: Result<()> = assert_send(bluetooth.use_adapter(0)).await;

    let _devices: Result<Vec<Device>> = assert_send(bluetooth.get_devices()).await;

    let scan: Result<_> = assert_send(bluetooth.scan(RequestDeviceOptions::accept_all())).await;
    let scan = scan?;
    futures_lite::pin!(scan);
    let _device: Option<Device> = assert_send(scan.next()).await;

    bluetooth.cancel_request();

    let options = RequestDeviceOptions::with_filters(vec![ScanFilter::services([bluetooth_uuid_from_u16(0x1800)])]);
    let device: Result<Device> = assert_send(bluetooth.request_device(options)).await;
    device
}

async fn check_device_apis(device: Device) -> Result<Service> {
    let _id: &DeviceId = device.id();
    let _name: String = device.name();
    let _adv: AdvertisementData = device.adv_data();
    let _allowed: Vec<Uuid> = device.allowed_services();

    let server: &RemoteGattServer = device.gatt();
    let _connected: bool = server.connected();
    let _res: Result<()> = assert_send(server.connect()).await;

    let _services: Result<Vec<Service>> = assert_send(server.get_primary_services()).await;
    let _services: Result<Vec<Service>> =
        assert_send(server.get_primary_services_with_uuid(bluetooth_uuid_from_u16(0x1800))).await;
    let service: Result<Service> = assert_send(server.get_primary_service("generic_access")).await;

    let _res: Result<()> = assert_send(server.disconnect()).await;
    let _res: Result<()> = assert_send(device.forget()).await;

    service
}

async fn check_service_apis(service: Service) -> Result<Characteristic> {
    let _uuid: Uuid = service.uuid();
    let _is_primary: bool = service.is_primary();
    let _device: Option<Device> = service.device();

    let _characteristics: Result<Vec<Characteristic>> = assert_send(service.get_characteristics()).await;
    let _characteristics: Result<Vec<Characteristic>> =
        assert_send(service.get_characteristics_with_uuid(bluetooth_uuid_from_u16(0x2A00))).await;

    let _included: Result<Vec<Service>> = assert_send(service.get_included_services()).await;
    let _included: Result<Vec<Service>> =
        assert_send(service.get_included_services_with_uuid(bluetooth_uuid_from_u16(0x1800))).await;
    let _included: Result<Service> = assert_send(service.get_included_service(0x1801u16)).await;

    let characteristic: Result<Characteristic> = assert_send(service.get_characteristic("gap.device_name")).await;
    characteristic
}

async fn check_characteristic_apis(characteristic: Characteristic) -> Result<Descriptor> {
    let _uuid: Uuid = characteristic.uuid();
    let _props: CharacteristicProperties = characteristic.properties();
    let _value: Option<Vec<u8>> = characteristic.value();
    let _service: Option<Service> = characteristic.service();
    let _notifying: bool = characteristic.is_notifying();

    let _value: Result<Vec<u8>> = assert_send(characteristic.read_value()).await;
    let _res: Result<()> = assert_send(characteristic.write_value(&[0u8])).await;
    let _res: Result<()> = assert_send(characteristic.write_value_with_response(&[0u8])).await;
    let _res: Result<()> = assert_send(characteristic.write_value_without_response(&[0u8])).await;

    let _res: Result<()> = assert_send(characteristic.start_notifications()).await;
    let _res: Result<()> = assert_send(characteristic.stop_notifications()).await;

    let _descriptors: Result<Vec<Descriptor>> = assert_send(characteristic.get_descriptors()).await;
    let _descriptors: Result<Vec<Descriptor>> = assert_send(
        characteristic.get_descriptors_with_uuid(bluetooth_uuid_from_u16(0x2902)),
    )
    .await;

    let descriptor: Result<Descriptor> =
        assert_send(characteristic.get_descriptor("gatt.client_characteristic_configuration")).await;
    descriptor
}

async fn check_descriptor_apis(descriptor: Descriptor) -> Result<()> {
    let _uuid: Uuid = descriptor.uuid();
    let _value: Option<Vec<u8>> = descriptor.value();
    let _characteristic: Option<Characteristic> = descriptor.characteristic();

    let _value: Result<Vec<u8>> = assert_send(descriptor.read_value()).await;
    let _res: Result<()> = assert_send(descriptor.write_value(&[0u8])).await;

    Ok(())
}

#[allow(unused)]
async fn check_apis(backend: Backend) -> Result<()> {
    let device = check_bluetooth_apis(backend).await?;
    let service = check_device_apis(device).await?;
    let characteristic = check_service_apis(service).await?;
    let descriptor = check_characteristic_apis(characteristic).await?;
    check_descriptor_apis(descriptor).await?;

    Ok(())
}

#[test]
fn public_types_are_send_and_sync() {
    fn assert_send_sync<T: Send + Sync>() {}

    assert_send_sync::<Bluetooth>();
    assert_send_sync::<Backend>();
    assert_send_sync::<Device>();
    assert_send_sync::<RemoteGattServer>();
    assert_send_sync::<Service>();
    assert_send_sync::<Characteristic>();
    assert_send_sync::<Descriptor>();
    assert_send_sync::<DeviceSelector>();
    assert_send_sync::<Error>();
}
