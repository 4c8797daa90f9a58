//! Per-model command catalog.
//!
//! Maps each abstract operation to the concrete bulk message the model
//! uses for it, or `None` where the model has no such message. All
//! model-specific dispatch goes through this table; nothing else in the
//! crate branches on the product id for protocol decisions.

use crate::protocol::BulkCode;

/// The bulk message assignment for one model family.
#[derive(Debug)]
pub struct ProtocolCatalog {
    pub set_filter: Option<BulkCode>,
    pub set_record_length: Option<BulkCode>,
    pub set_channels: Option<BulkCode>,
    pub set_gain: BulkCode,
    pub set_samplerate: Option<BulkCode>,
    pub set_trigger: Option<BulkCode>,
    pub set_pretrigger: Option<BulkCode>,
}

/// DSO-2090 and DSO-2150: everything lives in the combined
/// SetTriggerAndSamplerate message.
static CATALOG_2090: ProtocolCatalog = ProtocolCatalog {
    set_filter: Some(BulkCode::SetFilter),
    set_record_length: Some(BulkCode::SetTriggerAndSamplerate),
    set_channels: Some(BulkCode::SetTriggerAndSamplerate),
    set_gain: BulkCode::SetGain,
    set_samplerate: Some(BulkCode::SetTriggerAndSamplerate),
    set_trigger: Some(BulkCode::SetTriggerAndSamplerate),
    set_pretrigger: Some(BulkCode::SetTriggerAndSamplerate),
};

static CATALOG_2250: ProtocolCatalog = ProtocolCatalog {
    set_filter: None,
    set_record_length: Some(BulkCode::DSetBuffer),
    set_channels: Some(BulkCode::BSetChannels),
    set_gain: BulkCode::SetGain,
    set_samplerate: Some(BulkCode::ESetTriggerOrSamplerate),
    set_trigger: Some(BulkCode::CSetTriggerOrSamplerate),
    set_pretrigger: Some(BulkCode::FSetBuffer),
};

static CATALOG_5200: ProtocolCatalog = ProtocolCatalog {
    set_filter: Some(BulkCode::SetFilter),
    set_record_length: Some(BulkCode::DSetBuffer),
    set_channels: Some(BulkCode::ESetTriggerOrSamplerate),
    set_gain: BulkCode::SetGain,
    set_samplerate: Some(BulkCode::CSetTriggerOrSamplerate),
    set_trigger: Some(BulkCode::ESetTriggerOrSamplerate),
    set_pretrigger: Some(BulkCode::DSetBuffer),
};

/// Catalog for a product id, `None` for models that do not speak the
/// 2xxx/5xxx protocol (including the 6022 family before renumeration).
pub fn catalog_for(product_id: u16) -> Option<&'static ProtocolCatalog> {
    match product_id {
        0x2090 | 0x2150 => Some(&CATALOG_2090),
        0x2250 => Some(&CATALOG_2250),
        0x5200 | 0x520A => Some(&CATALOG_5200),
        _ => None,
    }
}
