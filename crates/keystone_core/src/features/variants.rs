//! Built-in per-revision variants of the core capabilities.
//!
//! Each variant encodes one capability the way a particular range of
//! revisions expects it on the wire. [`install_builtin`] registers every
//! variant under its feature template for each known revision it covers;
//! revisions a variant does not cover are simply left unregistered, which
//! the registry reports as an unsupported revision.

use super::{
    feature_factory, BarColor, BoundaryEffect, BoundaryEffectFeature, Feature, FloatingText,
    FloatingTextFeature, InputDialog, InputDialogFeature, MenuFeature, MenuRenderer, StatusBar,
    StatusBarFeature, TitleDisplay, TitleFeature, TitleTimes,
};
use crate::lookup::{ArgKind, ImplementationCatalog};
use crate::revision::{
    RevisionTag, KNOWN_REVISIONS, V1_12_R1, V1_16_R3, V1_17_R1, V1_19_R3, V1_20_R1,
};
use crate::types::Packet;
use serde_json::json;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// Known revisions selected by `filter`.
fn revisions(filter: impl Fn(RevisionTag) -> bool) -> Vec<RevisionTag> {
    KNOWN_REVISIONS.iter().copied().filter(|r| filter(*r)).collect()
}

/// Registers every built-in variant in `catalog`.
pub fn install_builtin(catalog: &mut ImplementationCatalog) {
    // Menus
    catalog.register_for(
        MenuFeature::TEMPLATE,
        &revisions(|r| r.is_older_than(V1_16_R3)),
        feature_factory::<MenuFeature, _>(vec![], |_| {
            Ok(Arc::new(WindowMenu) as Arc<dyn MenuRenderer>)
        }),
    );
    catalog.register_for(
        MenuFeature::TEMPLATE,
        &revisions(|r| r.is_at_least(V1_16_R3)),
        feature_factory::<MenuFeature, _>(vec![], |_| {
            Ok(Arc::new(ScreenMenu) as Arc<dyn MenuRenderer>)
        }),
    );

    // Floating text. Exactly v1_17_R1 removes entities one per message.
    for revision in revisions(|r| r.is_older_than(V1_19_R3)) {
        let single_removal = revision == V1_17_R1;
        catalog.register_for(
            FloatingTextFeature::TEMPLATE,
            &[revision],
            feature_factory::<FloatingTextFeature, _>(vec![ArgKind::Float], move |args| {
                let spacing = line_spacing(args)?;
                Ok(Arc::new(ArmorStandText {
                    spacing,
                    single_removal,
                }) as Arc<dyn FloatingText>)
            }),
        );
    }
    catalog.register_for(
        FloatingTextFeature::TEMPLATE,
        &revisions(|r| r.is_at_least(V1_19_R3)),
        feature_factory::<FloatingTextFeature, _>(vec![ArgKind::Float], |args| {
            let spacing = line_spacing(args)?;
            Ok(Arc::new(TextDisplayText { spacing }) as Arc<dyn FloatingText>)
        }),
    );

    // Boundary effect
    catalog.register_for(
        BoundaryEffectFeature::TEMPLATE,
        &revisions(|r| r.is_older_than(V1_17_R1)),
        feature_factory::<BoundaryEffectFeature, _>(vec![], |_| {
            Ok(Arc::new(ActionBorder) as Arc<dyn BoundaryEffect>)
        }),
    );
    catalog.register_for(
        BoundaryEffectFeature::TEMPLATE,
        &revisions(|r| r.is_at_least(V1_17_R1)),
        feature_factory::<BoundaryEffectFeature, _>(vec![], |_| {
            Ok(Arc::new(SplitBorder) as Arc<dyn BoundaryEffect>)
        }),
    );

    // Status bars do not exist before v1_12_R1.
    catalog.register_for(
        StatusBarFeature::TEMPLATE,
        &revisions(|r| r.is_at_least(V1_12_R1)),
        feature_factory::<StatusBarFeature, _>(vec![], |_| {
            Ok(Arc::new(BossEventBar) as Arc<dyn StatusBar>)
        }),
    );

    // Input dialogs
    catalog.register_for(
        InputDialogFeature::TEMPLATE,
        &revisions(|r| r.is_older_than(V1_20_R1)),
        feature_factory::<InputDialogFeature, _>(vec![], |_| {
            Ok(Arc::new(SignDialog { sided: false }) as Arc<dyn InputDialog>)
        }),
    );
    catalog.register_for(
        InputDialogFeature::TEMPLATE,
        &revisions(|r| r.is_at_least(V1_20_R1)),
        feature_factory::<InputDialogFeature, _>(vec![], |_| {
            Ok(Arc::new(SignDialog { sided: true }) as Arc<dyn InputDialog>)
        }),
    );

    // Titles
    catalog.register_for(
        TitleFeature::TEMPLATE,
        &revisions(|r| r.is_older_than(V1_17_R1)),
        feature_factory::<TitleFeature, _>(vec![], |_| {
            Ok(Arc::new(ActionTitle) as Arc<dyn TitleDisplay>)
        }),
    );
    catalog.register_for(
        TitleFeature::TEMPLATE,
        &revisions(|r| r.is_at_least(V1_17_R1)),
        feature_factory::<TitleFeature, _>(vec![], |_| {
            Ok(Arc::new(SplitTitle) as Arc<dyn TitleDisplay>)
        }),
    );

    debug!("Installed {} built-in implementations", catalog.len());
}

fn line_spacing(args: &[crate::lookup::ConstructorArg]) -> Result<f64, crate::lookup::BoxError> {
    let spacing = args
        .first()
        .and_then(|a| a.as_float())
        .ok_or("line spacing argument missing")?;
    if !spacing.is_finite() || spacing < 0.0 {
        return Err(format!("invalid line spacing {}", spacing).into());
    }
    Ok(spacing)
}

// ============================================================================
// Menus
// ============================================================================

/// Menus for revisions that address containers by type string and slot count.
pub struct WindowMenu;

impl MenuRenderer for WindowMenu {
    fn open(&self, window_id: u8, rows: u8, title: &str) -> Vec<Packet> {
        let rows = rows.clamp(1, 6);
        vec![Packet::from_json(&json!({
            "type": "open_window",
            "window_id": window_id,
            "window_type": "minecraft:chest",
            "title": title,
            "slots": u16::from(rows) * 9,
        }))]
    }

    fn close(&self, window_id: u8) -> Vec<Packet> {
        vec![Packet::from_json(
            &json!({ "type": "close_window", "window_id": window_id }),
        )]
    }
}

/// Menus for revisions with registry-indexed screen types.
pub struct ScreenMenu;

impl MenuRenderer for ScreenMenu {
    fn open(&self, window_id: u8, rows: u8, title: &str) -> Vec<Packet> {
        let rows = rows.clamp(1, 6);
        vec![Packet::from_json(&json!({
            "type": "open_screen",
            "container_id": window_id,
            "menu_type": format!("minecraft:generic_9x{}", rows),
            "title": { "text": title },
        }))]
    }

    fn close(&self, window_id: u8) -> Vec<Packet> {
        vec![Packet::from_json(
            &json!({ "type": "container_close", "container_id": window_id }),
        )]
    }
}

// ============================================================================
// Floating text
// ============================================================================

/// Invisible armor stands with custom names.
pub struct ArmorStandText {
    spacing: f64,
    single_removal: bool,
}

impl FloatingText for ArmorStandText {
    fn spawn(&self, first_entity_id: i32, position: [f64; 3], lines: &[String]) -> Vec<Packet> {
        let [x, y, z] = position;
        let mut packets = Vec::with_capacity(lines.len() * 2);
        for (index, (entity_id, line)) in (first_entity_id..).zip(lines).enumerate() {
            packets.push(Packet::from_json(&json!({
                "type": "add_entity",
                "entity_id": entity_id,
                "entity_type": "armor_stand",
                "x": x,
                "y": y - self.spacing * index as f64,
                "z": z,
            })));
            packets.push(Packet::from_json(&json!({
                "type": "set_entity_data",
                "entity_id": entity_id,
                "invisible": true,
                "marker": true,
                "custom_name": line,
                "custom_name_visible": true,
            })));
        }
        packets
    }

    fn despawn(&self, entity_ids: &[i32]) -> Vec<Packet> {
        if entity_ids.is_empty() {
            return Vec::new();
        }
        if self.single_removal {
            entity_ids
                .iter()
                .map(|id| Packet::from_json(&json!({ "type": "remove_entity", "entity_id": id })))
                .collect()
        } else {
            vec![Packet::from_json(
                &json!({ "type": "remove_entities", "entity_ids": entity_ids }),
            )]
        }
    }
}

/// Dedicated text display entities.
pub struct TextDisplayText {
    spacing: f64,
}

impl FloatingText for TextDisplayText {
    fn spawn(&self, first_entity_id: i32, position: [f64; 3], lines: &[String]) -> Vec<Packet> {
        let [x, y, z] = position;
        (first_entity_id..)
            .zip(lines)
            .enumerate()
            .flat_map(|(index, (entity_id, line))| {
                [
                    Packet::from_json(&json!({
                        "type": "add_entity",
                        "entity_id": entity_id,
                        "entity_type": "text_display",
                        "x": x,
                        "y": y - self.spacing * index as f64,
                        "z": z,
                    })),
                    Packet::from_json(&json!({
                        "type": "set_entity_data",
                        "entity_id": entity_id,
                        "text": { "text": line },
                        "billboard": "center",
                    })),
                ]
            })
            .collect()
    }

    fn despawn(&self, entity_ids: &[i32]) -> Vec<Packet> {
        if entity_ids.is_empty() {
            return Vec::new();
        }
        vec![Packet::from_json(
            &json!({ "type": "remove_entities", "entity_ids": entity_ids }),
        )]
    }
}

// ============================================================================
// Boundary effect
// ============================================================================

/// Single world border message carrying an action discriminator.
pub struct ActionBorder;

impl BoundaryEffect for ActionBorder {
    fn show(&self, center_x: f64, center_z: f64, diameter: f64, warning_blocks: i32) -> Vec<Packet> {
        vec![Packet::from_json(&json!({
            "type": "world_border",
            "action": "initialize",
            "x": center_x,
            "z": center_z,
            "old_diameter": diameter,
            "new_diameter": diameter,
            "speed": 0,
            "portal_teleport_boundary": 29_999_984,
            "warning_time": 0,
            "warning_blocks": warning_blocks,
        }))]
    }

    fn clear(&self) -> Vec<Packet> {
        vec![Packet::from_json(
            &json!({ "type": "world_border", "action": "set_warning_blocks", "warning_blocks": 0 }),
        )]
    }
}

/// One message per border property.
pub struct SplitBorder;

impl BoundaryEffect for SplitBorder {
    fn show(&self, center_x: f64, center_z: f64, diameter: f64, warning_blocks: i32) -> Vec<Packet> {
        vec![
            Packet::from_json(&json!({
                "type": "set_border_center",
                "x": center_x,
                "z": center_z,
            })),
            Packet::from_json(&json!({ "type": "set_border_size", "diameter": diameter })),
            Packet::from_json(&json!({
                "type": "set_border_warning_distance",
                "warning_blocks": warning_blocks,
            })),
        ]
    }

    fn clear(&self) -> Vec<Packet> {
        vec![Packet::from_json(
            &json!({ "type": "set_border_warning_distance", "warning_blocks": 0 }),
        )]
    }
}

// ============================================================================
// Status bar
// ============================================================================

pub struct BossEventBar;

impl BossEventBar {
    fn event(bar: Uuid, operation: serde_json::Value) -> Packet {
        Packet::from_json(&json!({
            "type": "boss_event",
            "id": bar,
            "operation": operation,
        }))
    }
}

impl StatusBar for BossEventBar {
    fn create(&self, bar: Uuid, title: &str, progress: f32, color: BarColor) -> Vec<Packet> {
        vec![Self::event(
            bar,
            json!({
                "action": "add",
                "title": title,
                "progress": progress.clamp(0.0, 1.0),
                "color": color,
                "overlay": "progress",
            }),
        )]
    }

    fn update_progress(&self, bar: Uuid, progress: f32) -> Vec<Packet> {
        vec![Self::event(
            bar,
            json!({ "action": "update_progress", "progress": progress.clamp(0.0, 1.0) }),
        )]
    }

    fn update_title(&self, bar: Uuid, title: &str) -> Vec<Packet> {
        vec![Self::event(
            bar,
            json!({ "action": "update_name", "title": title }),
        )]
    }

    fn remove(&self, bar: Uuid) -> Vec<Packet> {
        vec![Self::event(bar, json!({ "action": "remove" }))]
    }
}

// ============================================================================
// Input dialog
// ============================================================================

/// Sign editor. From v1_20_R1 the message also says which face is edited.
pub struct SignDialog {
    sided: bool,
}

impl InputDialog for SignDialog {
    fn open_sign(&self, x: i32, y: i32, z: i32) -> Vec<Packet> {
        let mut message = json!({
            "type": "open_sign_editor",
            "x": x,
            "y": y,
            "z": z,
        });
        if self.sided {
            message["is_front_text"] = json!(true);
        }
        vec![Packet::from_json(&message)]
    }
}

// ============================================================================
// Titles
// ============================================================================

/// Single title message with an action discriminator.
pub struct ActionTitle;

impl TitleDisplay for ActionTitle {
    fn show(&self, title: &str, subtitle: &str, times: TitleTimes) -> Vec<Packet> {
        vec![
            Packet::from_json(&json!({
                "type": "title",
                "action": "times",
                "fade_in": times.fade_in,
                "stay": times.stay,
                "fade_out": times.fade_out,
            })),
            Packet::from_json(&json!({ "type": "title", "action": "subtitle", "text": subtitle })),
            Packet::from_json(&json!({ "type": "title", "action": "title", "text": title })),
        ]
    }

    fn clear(&self) -> Vec<Packet> {
        vec![Packet::from_json(&json!({ "type": "title", "action": "reset" }))]
    }
}

/// One message per title element.
pub struct SplitTitle;

impl TitleDisplay for SplitTitle {
    fn show(&self, title: &str, subtitle: &str, times: TitleTimes) -> Vec<Packet> {
        vec![
            Packet::from_json(&json!({
                "type": "set_titles_animation",
                "fade_in": times.fade_in,
                "stay": times.stay,
                "fade_out": times.fade_out,
            })),
            Packet::from_json(&json!({ "type": "set_subtitle_text", "text": subtitle })),
            Packet::from_json(&json!({ "type": "set_title_text", "text": title })),
        ]
    }

    fn clear(&self) -> Vec<Packet> {
        vec![Packet::from_json(
            &json!({ "type": "clear_titles", "reset": true }),
        )]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::FeatureRegistry;
    use crate::revision::{V1_17_R1_1, V1_18_R2, V1_20_R3, V1_8_R3};

    fn registry(revision: RevisionTag) -> FeatureRegistry {
        let mut catalog = ImplementationCatalog::new();
        install_builtin(&mut catalog);
        FeatureRegistry::new(revision, Arc::new(catalog))
    }

    fn kinds(packets: &[Packet]) -> Vec<String> {
        packets.iter().map(|p| p.kind().unwrap()).collect()
    }

    #[test]
    fn test_every_known_revision_has_a_menu() {
        for revision in KNOWN_REVISIONS {
            assert!(registry(*revision).get_typed::<MenuFeature>().is_ok());
        }
    }

    #[test]
    fn test_menu_encoding_follows_revision() {
        let legacy = registry(V1_12_R1).get_typed::<MenuFeature>().unwrap();
        assert_eq!(kinds(&legacy.open(1, 3, "Shop")), ["open_window"]);
        let slots: u16 = legacy.open(1, 9, "Shop")[0].field_as("slots").unwrap();
        assert_eq!(slots, 54);

        let modern = registry(V1_20_R3).get_typed::<MenuFeature>().unwrap();
        let open = modern.open(1, 3, "Shop");
        assert_eq!(kinds(&open), ["open_screen"]);
        let menu_type: String = open[0].field_as("menu_type").unwrap();
        assert_eq!(menu_type, "minecraft:generic_9x3");
    }

    #[test]
    fn test_floating_text_removal_differs_on_v1_17_r1() {
        let ids = [10, 11, 12];

        let exact = registry(V1_17_R1).get_typed::<FloatingTextFeature>().unwrap();
        assert_eq!(exact.despawn(&ids).len(), 3);

        let sub_release = registry(V1_17_R1_1)
            .get_typed::<FloatingTextFeature>()
            .unwrap();
        assert_eq!(kinds(&sub_release.despawn(&ids)), ["remove_entities"]);

        let older = registry(V1_16_R3).get_typed::<FloatingTextFeature>().unwrap();
        assert_eq!(older.despawn(&ids).len(), 1);
    }

    #[test]
    fn test_floating_text_entity_type_and_spacing() {
        let lines = vec!["top".to_string(), "bottom".to_string()];

        let stands = registry(V1_18_R2).get_typed::<FloatingTextFeature>().unwrap();
        let packets = stands.spawn(100, [0.0, 10.0, 0.0], &lines);
        assert_eq!(packets.len(), 4);
        let kind: String = packets[0].field_as("entity_type").unwrap();
        assert_eq!(kind, "armor_stand");
        let second_y: f64 = packets[2].field_as("y").unwrap();
        assert!((second_y - 9.75).abs() < f64::EPSILON);

        let displays = registry(V1_20_R3).get_typed::<FloatingTextFeature>().unwrap();
        let kind: String = displays.spawn(100, [0.0; 3], &lines)[0]
            .field_as("entity_type")
            .unwrap();
        assert_eq!(kind, "text_display");
    }

    #[test]
    fn test_status_bar_missing_on_v1_8_r3() {
        assert!(registry(V1_8_R3).get_typed::<StatusBarFeature>().is_err());
        let bar = registry(V1_12_R1).get_typed::<StatusBarFeature>().unwrap();
        let packet = &bar.update_progress(Uuid::nil(), 3.5)[0];
        let operation = packet.field("operation").unwrap();
        assert_eq!(operation["progress"], json!(1.0));
    }

    #[test]
    fn test_sign_editor_face_flag() {
        let legacy = registry(V1_18_R2).get_typed::<InputDialogFeature>().unwrap();
        assert!(legacy.open_sign(1, 64, 1)[0].field("is_front_text").is_err());

        let sided = registry(V1_20_R3).get_typed::<InputDialogFeature>().unwrap();
        let front: bool = sided.open_sign(1, 64, 1)[0]
            .field_as("is_front_text")
            .unwrap();
        assert!(front);
    }

    #[test]
    fn test_titles_and_border_split_from_v1_17() {
        let old_title = registry(V1_16_R3).get_typed::<TitleFeature>().unwrap();
        assert_eq!(
            kinds(&old_title.show("a", "b", TitleTimes::default())),
            ["title", "title", "title"]
        );
        let new_title = registry(V1_17_R1).get_typed::<TitleFeature>().unwrap();
        assert_eq!(
            kinds(&new_title.show("a", "b", TitleTimes::default())),
            ["set_titles_animation", "set_subtitle_text", "set_title_text"]
        );

        let old_border = registry(V1_12_R1)
            .get_typed::<BoundaryEffectFeature>()
            .unwrap();
        assert_eq!(kinds(&old_border.show(0.0, 0.0, 100.0, 5)), ["world_border"]);
        let new_border = registry(V1_20_R3)
            .get_typed::<BoundaryEffectFeature>()
            .unwrap();
        assert_eq!(new_border.show(0.0, 0.0, 100.0, 5).len(), 3);
    }
}
