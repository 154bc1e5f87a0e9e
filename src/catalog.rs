//! Default braid styles and colors offered by a fresh installation.
//! The PostgreSQL store seeds the same rows from its initial migration.

use crate::types::{BraidStyle, Color};
use uuid::Uuid;

const BRAID_STYLES: [(&str, &str, f64, i32); 4] = [
    ("Box Braids", "Classic box-parted braids", 150.0, 240),
    ("Nagô Braids", "Traditional cornrows", 120.0, 180),
    ("Fulani Braids", "Fulani braids with detailing", 140.0, 200),
    ("Ghana Braids", "Ghana braids with a unique pattern", 130.0, 220),
];

const COLORS: [(&str, &str); 7] = [
    ("Black", "#1a1a1a"),
    ("Brown", "#6B4423"),
    ("Blonde", "#D4AF37"),
    ("Auburn", "#A0522D"),
    ("Burgundy", "#722F37"),
    ("Blue", "#4169E1"),
    ("Mixed", "#9370DB"),
];

pub fn default_braid_styles() -> Vec<BraidStyle> {
    BRAID_STYLES
        .iter()
        .map(|(name, description, base_price, estimated_duration)| BraidStyle {
            id: Uuid::new_v4(),
            name: name.to_string(),
            description: Some(description.to_string()),
            base_price: *base_price,
            estimated_duration: *estimated_duration,
        })
        .collect()
}

pub fn default_colors() -> Vec<Color> {
    COLORS
        .iter()
        .map(|(name, hex_code)| Color {
            id: Uuid::new_v4(),
            name: name.to_string(),
            hex_code: hex_code.to_string(),
        })
        .collect()
}
