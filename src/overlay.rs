//! Markers and popups drawn above the map layers.

use egui::{Align2, Color32, FontId, Painter, Pos2, Rect, Shape, Stroke, pos2, vec2};

use crate::projection::{GeoPos, MapProjection};

/// Handle of a marker on a surface.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, PartialOrd, Ord)]
pub struct MarkerId(pub u64);

/// A pin on the map with an optional label popup.
#[derive(Clone, Debug, PartialEq)]
pub struct Marker {
    /// Where the pin points.
    pub position: GeoPos,

    /// Pin color.
    pub color: Color32,

    /// Text shown in the label popup.
    pub label: Option<String>,

    /// Whether the label popup is open. Clicking the pin toggles it.
    pub label_open: bool,
}

impl Marker {
    /// A marker with the default color and no label.
    pub fn new(position: GeoPos) -> Self {
        Self {
            position,
            color: Color32::from_rgb(0x31, 0x82, 0xce),
            label: None,
            label_open: false,
        }
    }

    /// Sets the pin color.
    pub fn with_color(mut self, color: Color32) -> Self {
        self.color = color;
        self
    }

    /// Attaches a label popup, initially closed.
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }
}

/// A key/value popup anchored to a map position.
#[derive(Clone, Debug, PartialEq)]
pub struct Popup {
    /// Where the popup points.
    pub anchor: GeoPos,

    /// Optional heading.
    pub title: Option<String>,

    /// Rows of already formatted text. Shown as plain labels.
    pub rows: Vec<(String, String)>,
}

const PIN_RADIUS: f32 = 7.0;
const PIN_HEIGHT: f32 = 22.0;

/// Screen rectangle of the pin head, used for hit testing.
pub(crate) fn marker_hit_rect(marker: &Marker, projection: &MapProjection) -> Option<Rect> {
    if !projection.is_visible(marker.position) {
        return None;
    }
    let tip = projection.project(marker.position);
    let head = tip - vec2(0.0, PIN_HEIGHT - PIN_RADIUS);
    Some(Rect::from_center_size(head, vec2(PIN_RADIUS * 2.5, PIN_RADIUS * 2.5)))
}

/// Draws a marker pin and, if open, its label.
pub(crate) fn draw_marker(painter: &Painter, marker: &Marker, projection: &MapProjection) {
    if !projection.is_visible(marker.position) {
        return;
    }
    let tip = projection.project(marker.position);
    let head = tip - vec2(0.0, PIN_HEIGHT - PIN_RADIUS);

    painter.add(Shape::convex_polygon(
        vec![
            tip,
            head + vec2(PIN_RADIUS * 0.8, PIN_RADIUS * 0.6),
            head + vec2(-PIN_RADIUS * 0.8, PIN_RADIUS * 0.6),
        ],
        marker.color,
        Stroke::NONE,
    ));
    painter.circle(head, PIN_RADIUS, marker.color, Stroke::new(1.5, Color32::WHITE));
    painter.circle_filled(head, PIN_RADIUS * 0.35, Color32::WHITE);

    if let (true, Some(label)) = (marker.label_open, &marker.label) {
        draw_label(painter, label, head - vec2(0.0, PIN_RADIUS + 6.0));
    }
}

fn draw_label(painter: &Painter, text: &str, bottom_center: Pos2) {
    let galley = painter.layout_no_wrap(
        text.to_string(),
        FontId::proportional(13.0),
        Color32::BLACK,
    );
    let rect = Align2::CENTER_BOTTOM.anchor_rect(Rect::from_min_size(bottom_center, galley.size()));
    let background = rect.expand2(vec2(6.0, 4.0));

    painter.rect_filled(background, 4.0, Color32::from_rgba_unmultiplied(255, 255, 255, 235));
    painter.add(Shape::convex_polygon(
        vec![
            pos2(bottom_center.x - 5.0, background.bottom()),
            pos2(bottom_center.x + 5.0, background.bottom()),
            pos2(bottom_center.x, background.bottom() + 5.0),
        ],
        Color32::from_rgba_unmultiplied(255, 255, 255, 235),
        Stroke::NONE,
    ));
    painter.galley(rect.min, galley, Color32::TRANSPARENT);
}
