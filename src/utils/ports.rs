use anyhow::Result;

/// Return a sorted list of available serial ports as (port_name, port_type_string).
pub fn enumerate_ports() -> Result<Vec<(String, String)>> {
    let mut ports = serialport::available_ports()?;
    ports.sort_by(|a, b| a.port_name.cmp(&b.port_name));
    Ok(ports
        .into_iter()
        .map(|p| {
            let kind = match p.port_type {
                serialport::SerialPortType::UsbPort(info) => match info.product {
                    Some(product) => format!("USB ({product})"),
                    None => format!("USB {:04x}:{:04x}", info.vid, info.pid),
                },
                serialport::SerialPortType::PciPort => "PCI".to_string(),
                serialport::SerialPortType::BluetoothPort => "Bluetooth".to_string(),
                serialport::SerialPortType::Unknown => "Unknown".to_string(),
            };
            (p.port_name, kind)
        })
        .collect())
}
