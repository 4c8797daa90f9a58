//! Model records for the supported oscilloscopes.
//!
//! One entry per product id. The DSO-6022 family enumerates with the
//! Cypress bootloader ids until its firmware is uploaded, after which it
//! renumerates as a DSO-2xxx.

/// Description of one supported device model.
#[derive(Debug)]
pub struct DeviceModel {
    pub vendor_id: u16,
    pub product_id: u16,
    pub name: &'static str,
    /// Not covered by hardware testing; a warning is logged at connect.
    pub unofficial: bool,
    /// Needs a firmware upload before it exposes the scope protocol.
    pub needs_firmware: bool,
    pub bulk_endpoint_out: u8,
    pub bulk_endpoint_in: u8,
}

const VENDOR_HANTEK: u16 = 0x04B5;
const VENDOR_CYPRESS: u16 = 0x04B4;

const EP_OUT: u8 = 0x02;
const EP_IN: u8 = 0x86;

/// All recognized models.
pub static MODELS: &[DeviceModel] = &[
    DeviceModel {
        vendor_id: VENDOR_HANTEK,
        product_id: 0x2090,
        name: "DSO-2090",
        unofficial: false,
        needs_firmware: false,
        bulk_endpoint_out: EP_OUT,
        bulk_endpoint_in: EP_IN,
    },
    DeviceModel {
        vendor_id: VENDOR_HANTEK,
        product_id: 0x2150,
        name: "DSO-2150",
        unofficial: true,
        needs_firmware: false,
        bulk_endpoint_out: EP_OUT,
        bulk_endpoint_in: EP_IN,
    },
    DeviceModel {
        vendor_id: VENDOR_HANTEK,
        product_id: 0x2250,
        name: "DSO-2250",
        unofficial: false,
        needs_firmware: false,
        bulk_endpoint_out: EP_OUT,
        bulk_endpoint_in: EP_IN,
    },
    DeviceModel {
        vendor_id: VENDOR_HANTEK,
        product_id: 0x5200,
        name: "DSO-5200",
        unofficial: false,
        needs_firmware: false,
        bulk_endpoint_out: EP_OUT,
        bulk_endpoint_in: EP_IN,
    },
    DeviceModel {
        vendor_id: VENDOR_HANTEK,
        product_id: 0x520A,
        name: "DSO-5200A",
        unofficial: true,
        needs_firmware: false,
        bulk_endpoint_out: EP_OUT,
        bulk_endpoint_in: EP_IN,
    },
    DeviceModel {
        vendor_id: VENDOR_CYPRESS,
        product_id: 0x6022,
        name: "DSO-6022BE",
        unofficial: false,
        needs_firmware: true,
        bulk_endpoint_out: EP_OUT,
        bulk_endpoint_in: EP_IN,
    },
    DeviceModel {
        vendor_id: VENDOR_CYPRESS,
        product_id: 0x602A,
        name: "DSO-6022BL",
        unofficial: false,
        needs_firmware: true,
        bulk_endpoint_out: EP_OUT,
        bulk_endpoint_in: EP_IN,
    },
];

/// Look up a model by USB ids. Returns `None` for unrecognized devices.
pub fn model_for(vendor_id: u16, product_id: u16) -> Option<&'static DeviceModel> {
    MODELS
        .iter()
        .find(|m| m.vendor_id == vendor_id && m.product_id == product_id)
}

/// Look up a model by product id alone (the vendor id flips between the
/// bootloader and the initialized device).
pub fn model_for_product(product_id: u16) -> Option<&'static DeviceModel> {
    MODELS.iter().find(|m| m.product_id == product_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_product_ids_present() {
        for pid in [0x2090, 0x2150, 0x2250, 0x5200, 0x520A, 0x6022, 0x602A] {
            assert!(model_for_product(pid).is_some(), "missing model {pid:#06x}");
        }
    }

    #[test]
    fn no_duplicate_product_ids() {
        for i in 0..MODELS.len() {
            for j in (i + 1)..MODELS.len() {
                assert_ne!(MODELS[i].product_id, MODELS[j].product_id);
            }
        }
    }

    #[test]
    fn firmware_flags() {
        assert!(!model_for_product(0x2090).unwrap().needs_firmware);
        assert!(model_for_product(0x6022).unwrap().needs_firmware);
        assert!(model_for_product(0x602A).unwrap().needs_firmware);
    }

    #[test]
    fn unofficial_models_marked() {
        assert!(model_for_product(0x2150).unwrap().unofficial);
        assert!(model_for_product(0x520A).unwrap().unofficial);
        assert!(!model_for_product(0x2250).unwrap().unofficial);
    }

    #[test]
    fn lookup_by_vendor_and_product() {
        assert!(model_for(0x04B5, 0x2090).is_some());
        assert!(model_for(0x04B4, 0x6022).is_some());
        assert!(model_for(0x04B4, 0x2090).is_none());
        assert!(model_for(0xDEAD, 0xBEEF).is_none());
    }
}
