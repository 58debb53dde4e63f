//! Revision-sensitive features.
//!
//! A feature is a capability that higher-level modules build on (menus,
//! floating text, boundary effects, status bars, input dialogs, titles)
//! whose wire representation differs between server revisions. Each
//! capability is a trait; each revision-specific encoding is a small
//! variant implementing it. [`FeatureRegistry`] picks the variant for the
//! running revision on first use and hands out shared references after
//! that.
//!
//! Hosts can add their own capabilities by implementing [`Feature`] for a
//! marker type and registering variants in the
//! [`ImplementationCatalog`](crate::lookup::ImplementationCatalog) under
//! the feature's template.

mod registry;
pub mod variants;

pub use registry::{FeatureRegistry, ResolvedFeature};

use crate::lookup::{ArgKind, BoxError, ConstructorArg, Factory, Instance};
use crate::types::Packet;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

/// Ties a symbolic feature name to its capability trait and name template.
pub trait Feature: 'static {
    /// Symbolic name, used for lookups by string.
    const NAME: &'static str;
    /// Implementation name template; `{revision}` is replaced by the tag.
    const TEMPLATE: &'static str;
    /// The capability trait object handed to callers.
    type Implementation: ?Sized + Send + Sync + 'static;

    /// Constructor arguments used when the registry builds this feature.
    fn default_args() -> Vec<ConstructorArg> {
        Vec::new()
    }
}

/// Builds a catalog [`Factory`] that yields `Arc<F::Implementation>`.
///
/// Registry lookups downcast to exactly that type, so variants must be
/// registered through this helper.
pub fn feature_factory<F, B>(signature: Vec<ArgKind>, build: B) -> Factory
where
    F: Feature,
    B: Fn(&[ConstructorArg]) -> Result<Arc<F::Implementation>, BoxError> + Send + Sync + 'static,
{
    Factory::new(signature, move |args| {
        build(args).map(|implementation| Box::new(implementation) as Instance)
    })
}

// ============================================================================
// Capabilities
// ============================================================================

/// Chest-style menus.
pub trait MenuRenderer: Send + Sync {
    /// Opens a menu of `rows` rows (1-6) in window `window_id`.
    fn open(&self, window_id: u8, rows: u8, title: &str) -> Vec<Packet>;
    fn close(&self, window_id: u8) -> Vec<Packet>;
}

/// Floating text lines shown above a point in the world.
pub trait FloatingText: Send + Sync {
    /// Spawns one entity per line, top line first, with ids starting at
    /// `first_entity_id`.
    fn spawn(&self, first_entity_id: i32, position: [f64; 3], lines: &[String]) -> Vec<Packet>;
    fn despawn(&self, entity_ids: &[i32]) -> Vec<Packet>;
}

/// Screen-edge tint driven by the world border warning.
pub trait BoundaryEffect: Send + Sync {
    fn show(&self, center_x: f64, center_z: f64, diameter: f64, warning_blocks: i32) -> Vec<Packet>;
    fn clear(&self) -> Vec<Packet>;
}

/// Colour of a status bar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BarColor {
    Pink,
    Blue,
    Red,
    Green,
    Yellow,
    Purple,
    White,
}

/// Boss-bar style status bars.
pub trait StatusBar: Send + Sync {
    fn create(&self, bar: Uuid, title: &str, progress: f32, color: BarColor) -> Vec<Packet>;
    fn update_progress(&self, bar: Uuid, progress: f32) -> Vec<Packet>;
    fn update_title(&self, bar: Uuid, title: &str) -> Vec<Packet>;
    fn remove(&self, bar: Uuid) -> Vec<Packet>;
}

/// Sign-based text input.
pub trait InputDialog: Send + Sync {
    fn open_sign(&self, x: i32, y: i32, z: i32) -> Vec<Packet>;
}

/// Fade timings for titles, in ticks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TitleTimes {
    pub fade_in: i32,
    pub stay: i32,
    pub fade_out: i32,
}

impl Default for TitleTimes {
    fn default() -> Self {
        Self {
            fade_in: 10,
            stay: 70,
            fade_out: 20,
        }
    }
}

/// Large centred title and subtitle.
pub trait TitleDisplay: Send + Sync {
    fn show(&self, title: &str, subtitle: &str, times: TitleTimes) -> Vec<Packet>;
    fn clear(&self) -> Vec<Packet>;
}

// ============================================================================
// Feature markers
// ============================================================================

pub struct MenuFeature;

impl Feature for MenuFeature {
    const NAME: &'static str = "menu";
    const TEMPLATE: &'static str = "{revision}::menu::MenuRenderer";
    type Implementation = dyn MenuRenderer;
}

pub struct FloatingTextFeature;

impl Feature for FloatingTextFeature {
    const NAME: &'static str = "floating_text";
    const TEMPLATE: &'static str = "{revision}::entity::FloatingText";
    type Implementation = dyn FloatingText;

    /// Vertical distance between lines, in blocks.
    fn default_args() -> Vec<ConstructorArg> {
        vec![ConstructorArg::Float(0.25)]
    }
}

pub struct BoundaryEffectFeature;

impl Feature for BoundaryEffectFeature {
    const NAME: &'static str = "boundary_effect";
    const TEMPLATE: &'static str = "{revision}::border::BoundaryEffect";
    type Implementation = dyn BoundaryEffect;
}

pub struct StatusBarFeature;

impl Feature for StatusBarFeature {
    const NAME: &'static str = "status_bar";
    const TEMPLATE: &'static str = "{revision}::bar::StatusBar";
    type Implementation = dyn StatusBar;
}

pub struct InputDialogFeature;

impl Feature for InputDialogFeature {
    const NAME: &'static str = "input_dialog";
    const TEMPLATE: &'static str = "{revision}::dialog::InputDialog";
    type Implementation = dyn InputDialog;
}

pub struct TitleFeature;

impl Feature for TitleFeature {
    const NAME: &'static str = "title";
    const TEMPLATE: &'static str = "{revision}::title::TitleDisplay";
    type Implementation = dyn TitleDisplay;
}
