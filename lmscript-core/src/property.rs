use serde::Serialize;
use std::fmt;

/// Object property identifiers addressed by component command slots.
///
/// Column `i` of a component command's parameter table row holds property
/// `i + 1`; property 0 (`PR_NONE`) is never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct PropertyType(pub u16);

impl PropertyType {
    pub const NONE: PropertyType = PropertyType(0x00);
    pub const NAME: PropertyType = PropertyType(0x01);
    pub const SOURCE: PropertyType = PropertyType(0x03);
    pub const TEXT: PropertyType = PropertyType(0x33);

    /// Property held by the given parameter table column.
    pub fn from_slot(slot: usize) -> PropertyType {
        PropertyType((slot + 1) as u16)
    }

    /// Parameter table column holding this property.
    pub fn slot(self) -> Option<usize> {
        (self.0 as usize).checked_sub(1)
    }

    /// Engine constant name (`PR_FONTHEIGHT`), if known.
    pub fn constant_name(self) -> Option<&'static str> {
        PROPERTY_NAMES.get(self.0 as usize).copied()
    }

    /// Name used when presenting a component field: `Name` for the object
    /// name slot, the constant name otherwise.
    pub fn field_name(self) -> String {
        match self {
            PropertyType::NAME => "Name".to_string(),
            other => match other.constant_name() {
                Some(name) => name.to_string(),
                None => format!("PR_{:#04X}", other.0),
            },
        }
    }
}

impl fmt::Display for PropertyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.field_name())
    }
}

const PROPERTY_NAMES: [&str; 174] = [
    "PR_NONE", "PR_NAME", "PR_PARENT", "PR_SOURCE",
    "PR_LEFT", "PR_TOP", "PR_WIDTH", "PR_HEIGHT",
    "PR_ZOOMX", "PR_COLOR", "PR_BORDERWIDTH", "PR_BORDERCOLOR",
    "PR_ALPHA", "PR_PRIORITY", "PR_OFFSETX", "PR_OFFSETY",
    "PR_FONTNAME", "PR_FONTHEIGHT", "PR_FONTSTYLE", "PR_LINESPACE",
    "PR_FONTCOLOR", "PR_FONTLINKCOLOR", "PR_FONTBORDERCOLOR", "PR_FONTHOVERCOLOR",
    "PR_FONTHOVERSTYLE", "PR_HOVERCOLOR", "PR_ANTIALIAS", "PR_DELAY",
    "PR_PAUSED", "PR_VOLUME", "PR_REPEAT", "PR_BALANCE",
    "PR_ANGLE", "PR_ONPLAYING", "PR_ONNOTIFY", "PR_ONMOUSEMOVE",
    "PR_ONMOUSEOUT", "PR_ONLBTNDOWN", "PR_ONLBTNUP", "PR_ONRBTNDOWN",
    "PR_ONRBTNUP", "PR_ONWHEELDOWN", "PR_ONWHEELUP", "PR_BRIGHTNESS",
    "PR_ONPLAYEND", "PR_INDEX", "PR_COUNT", "PR_ONLINK",
    "PR_VISIBLE", "PR_COLCOUNT", "PR_ROWCOUNT", "PR_TEXT",
    "PR_MARGINX", "PR_MARGINY", "PR_HALIGN", "PR_BORDERSOURCETL",
    "PR_BORDERSOURCETC", "PR_BORDERSOURCETR", "PR_BORDERSOURCECL", "PR_BORDERSOURCECC",
    "PR_BORDERSOURCECR", "PR_BORDERSOURCEBL", "PR_BORDERSOURCEBC", "PR_BORDERSOURCEBR",
    "PR_BORDERHALIGNT", "PR_BORDERHALIGNC", "PR_BORDERHALIGNB", "PR_BORDERVALIGNL",
    "PR_BORDERVALIGNC", "PR_BORDERVALIGNR", "PR_SCROLLSOURCE", "PR_CHECKSOURCE",
    "PR_AUTOSCRAP", "PR_ONSELECT", "PR_RCLICKSCRAP", "PR_ONOPENING",
    "PR_ONOPENED", "PR_ONCLOSING", "PR_ONCLOSED", "PR_CARETX",
    "PR_CARETY", "PR_IGNOREMOUSE", "PR_TEXTPAUSED", "PR_TEXTDELAY",
    "PR_HOVERSOURCE", "PR_PRESSEDSOURCE", "PR_GROUPINDEX", "PR_ALLOWALLUP",
    "PR_SELECTED", "PR_CAPTUREMASK", "PR_POWER", "PR_ORIGWIDTH",
    "PR_ORIGHEIGHT", "PR_APPEARX", "PR_APPEARY", "PR_PARTMOTION",
    "PR_PARAM", "PR_PARAM2", "PR_TOPINDEX", "PR_READONLY",
    "PR_CURSOR", "PR_POSZOOMED", "PR_ONPLAYSTART", "PR_PARAM3",
    "PR_ONMOUSEIN", "PR_ONMAPIN", "PR_ONMAPOUT", "PR_MAPSOURCE",
    "PR_AMP", "PR_WAVELEN", "PR_SCROLLX", "PR_SCROLLY",
    "PR_FLIPH", "PR_FLIPV", "PR_ONIDLE", "PR_DISTANCEX",
    "PR_DISTANCEY", "PR_CLIPLEFT", "PR_CLIPTOP", "PR_CLIPWIDTH",
    "PR_CLIPHEIGHT", "PR_DURATION", "PR_THUMBSOURCE", "PR_BUTTONSOURCE",
    "PR_MIN", "PR_MAX", "PR_VALUE", "PR_ORIENTATION",
    "PR_SMALLCHANGE", "PR_LARGECHANGE", "PR_MAPTEXT", "PR_GLYPHWIDTH",
    "PR_GLYPHHEIGHT", "PR_ZOOMY", "PR_CLICKEDSOURCE", "PR_ANIPAUSED",
    "PR_ONHOLD", "PR_ONRELEASE", "PR_REVERSE", "PR_PLAYING",
    "PR_REWINDONLOAD", "PR_COMPOTYPE", "PR_FONTSHADOWCOLOR", "PR_FONTBORDER",
    "PR_FONTSHADOW", "PR_ONKEYDOWN", "PR_ONKEYUP", "PR_ONKEYREPEAT",
    "PR_HANDLEKEY", "PR_ONFOCUSIN", "PR_ONFOCUSOUT", "PR_OVERLAY",
    "PR_TAG", "PR_CAPTURELINK", "PR_FONTHOVERBORDER", "PR_FONTHOVERBORDERCOLOR",
    "PR_FONTHOVERSHADOW", "PR_FONTHOVERSHADOWCOLOR", "PR_BARSIZE", "PR_MUTEONLOAD",
    "PR_PLUSX", "PR_PLUSY", "PR_CARETHEIGHT", "PR_REPEATPOS",
    "PR_BLURSPAN", "PR_BLURDELAY", "PR_FONTCHANGEABLED", "PR_IMEMODE",
    "PR_FLOATANGLE", "PR_FLOATZOOMX", "PR_FLOATZOOMY", "PR_CAPMASKLEVEL",
    "PR_PADDINGLEFT", "PR_PADDING_RIGHT",
];

#[cfg(test)]
mod tests {
    use super::PropertyType;

    #[test]
    fn slots_are_offset_by_one() {
        assert_eq!(PropertyType::from_slot(0), PropertyType::NAME);
        assert_eq!(PropertyType::NAME.slot(), Some(0));
        assert_eq!(PropertyType::NONE.slot(), None);
    }

    #[test]
    fn names_known_and_unknown_properties() {
        assert_eq!(PropertyType::NAME.field_name(), "Name");
        assert_eq!(PropertyType(0x11).field_name(), "PR_FONTHEIGHT");
        assert_eq!(PropertyType(0xAD).field_name(), "PR_PADDING_RIGHT");
        assert_eq!(PropertyType(0xF0).field_name(), "PR_0xF0");
    }
}
