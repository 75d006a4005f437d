//! Layer (z-order) assignment for the items of one timeline row.
//!
//! Each role owns a band of `band_width` consecutive layers starting at its
//! base layer. Items without an explicit `Layer` are stacked into their band
//! top-down in registration order.

use std::collections::BTreeMap;

use serde_json::json;

use crate::model::{LayerBand, TemplateMap};

pub const DEFAULT_BAND_WIDTH: i64 = 10;

pub const TELOP_ROLE: &str = "テロップ";
pub const TACHIE_ROLE: &str = "立ち絵";
pub const PACK_ROLE: &str = "パック";
pub const BACKGROUND_ROLE: &str = "背景";
pub const OBJECT_ROLE_PREFIX: &str = "オブジェクト";
pub const FX_ROLE_PREFIX: &str = "FX";

const TELOP_BAND: i64 = 80;
const TACHIE_BAND: i64 = 70;
const PACK_BAND: i64 = 60;
const OBJECT_BAND: i64 = 60;
const FX_BAND: i64 = 50;
const BACKGROUND_BAND: i64 = 10;
const FALLBACK_BAND: i64 = 50;

/// Order offset between consecutive items registered for the same role.
pub const SUB_ORDER_STEP: f64 = 0.01;

/// One item waiting for its final layer.
#[derive(Debug, Clone, PartialEq)]
pub struct Placement {
    pub item: TemplateMap,
    pub band: i64,
    pub order: f64,
    pub explicit: bool,
    pub row_index: usize,
    pub role: Option<String>,
}

impl Placement {
    pub fn layer(&self) -> Option<i64> {
        self.item.get("Layer").and_then(|layer| layer.as_i64())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerOverflow {
    pub row_index: usize,
    pub band: i64,
    pub role: Option<String>,
}

impl LayerOverflow {
    pub fn message(&self) -> String {
        format!(
            "Layer band overflow at band {} for role '{}'",
            self.band,
            self.role.as_deref().unwrap_or("")
        )
    }
}

/// Band for `role`: explicit table, then role-name heuristics, then per-role defaults.
pub fn infer_layer_band(role: Option<&str>, bands: &BTreeMap<String, LayerBand>) -> i64 {
    let Some(role) = role else {
        return FALLBACK_BAND;
    };
    if let Some(band) = bands.get(role) {
        return band.layer;
    }
    if role.starts_with(OBJECT_ROLE_PREFIX) {
        return OBJECT_BAND;
    }
    if role.starts_with(FX_ROLE_PREFIX) {
        return FX_BAND;
    }
    match role {
        BACKGROUND_ROLE => BACKGROUND_BAND,
        TELOP_ROLE => TELOP_BAND,
        TACHIE_ROLE => TACHIE_BAND,
        PACK_ROLE => PACK_BAND,
        _ => FALLBACK_BAND,
    }
}

/// Writes `Layer` into every non-explicit placement and reports overflows.
///
/// Within a `(row, band)` group the first-registered item gets
/// `band + band_width - 1`; items past the band's capacity are clamped to
/// `band`, one overflow per clamped item.
pub fn allocate_layers(placements: &mut [Placement], band_width: i64) -> Vec<LayerOverflow> {
    let band_width = band_width.max(1);
    let mut groups: Vec<((usize, i64), Vec<usize>)> = Vec::new();
    for (index, placement) in placements.iter().enumerate() {
        if placement.explicit {
            continue;
        }
        let key = (placement.row_index, placement.band);
        match groups.iter_mut().find(|(existing, _)| *existing == key) {
            Some((_, members)) => members.push(index),
            None => groups.push((key, vec![index])),
        }
    }

    let mut overflows = Vec::new();
    for ((row_index, band), mut members) in groups {
        members.sort_by(|a, b| placements[*a].order.total_cmp(&placements[*b].order));
        for (slot, index) in members.into_iter().enumerate() {
            let slot = slot as i64;
            let placement = &mut placements[index];
            let layer = if slot >= band_width {
                overflows.push(LayerOverflow {
                    row_index,
                    band,
                    role: placement.role.clone(),
                });
                band
            } else {
                band + band_width - 1 - slot
            };
            placement.item.insert("Layer".to_owned(), json!(layer));
        }
    }
    overflows
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use serde_json::{json, Map};

    use super::{allocate_layers, infer_layer_band, Placement, DEFAULT_BAND_WIDTH};
    use crate::model::LayerBand;

    fn placement(order: f64, band: i64) -> Placement {
        Placement {
            item: Map::new(),
            band,
            order,
            explicit: false,
            row_index: 4,
            role: Some("オブジェクト1".to_owned()),
        }
    }

    #[test]
    fn eleven_items_fill_band_then_clamp_to_floor() {
        let mut placements = (0..11).map(|i| placement(i as f64, 70)).collect::<Vec<_>>();
        let overflows = allocate_layers(&mut placements, DEFAULT_BAND_WIDTH);

        let layers = placements.iter().map(|p| p.layer().unwrap()).collect::<Vec<_>>();
        assert_eq!(layers, vec![79, 78, 77, 76, 75, 74, 73, 72, 71, 70, 70]);
        assert_eq!(overflows.len(), 1);
        assert_eq!(overflows[0].band, 70);
        assert_eq!(
            overflows[0].message(),
            "Layer band overflow at band 70 for role 'オブジェクト1'"
        );
    }

    #[test]
    fn order_key_beats_insertion_order_and_explicit_items_are_skipped() {
        let mut placements = vec![placement(2.0, 60), placement(1.01, 60), placement(1.0, 60)];
        placements.push(Placement {
            item: json!({ "Layer": 3 }).as_object().unwrap().clone(),
            explicit: true,
            ..placement(0.0, 60)
        });

        let overflows = allocate_layers(&mut placements, 10);
        assert!(overflows.is_empty());
        assert_eq!(placements[2].layer(), Some(69));
        assert_eq!(placements[1].layer(), Some(68));
        assert_eq!(placements[0].layer(), Some(67));
        assert_eq!(placements[3].layer(), Some(3));
    }

    #[test]
    fn band_lookup_prefers_table_then_prefix_then_defaults() {
        let mut table = BTreeMap::new();
        table.insert(
            "テロップ".to_owned(),
            LayerBand {
                role: "テロップ".to_owned(),
                layer: 90,
            },
        );

        assert_eq!(infer_layer_band(Some("テロップ"), &table), 90);
        assert_eq!(infer_layer_band(Some("オブジェクト2"), &table), 60);
        assert_eq!(infer_layer_band(Some("FX_PARAM"), &table), 50);
        assert_eq!(infer_layer_band(Some("背景"), &table), 10);
        assert_eq!(infer_layer_band(Some("立ち絵"), &table), 70);
        assert_eq!(infer_layer_band(Some("パック"), &table), 60);
        assert_eq!(infer_layer_band(Some("misc"), &table), 50);
        assert_eq!(infer_layer_band(None, &table), 50);
    }
}
