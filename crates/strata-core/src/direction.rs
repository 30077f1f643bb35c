//! Writing direction detection.
//!
//! The first strong character of a block's text decides its direction.

/// Writing direction of a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Ltr,
    Rtl,
}

impl Direction {
    /// Value of the `dir` attribute.
    pub fn as_attr(self) -> &'static str {
        match self {
            Direction::Ltr => "ltr",
            Direction::Rtl => "rtl",
        }
    }
}

fn is_rtl(c: char) -> bool {
    matches!(c,
        '\u{0591}'..='\u{07FF}'
        | '\u{FB1D}'..='\u{FDFD}'
        | '\u{FE70}'..='\u{FEFC}')
}

fn is_ltr(c: char) -> bool {
    matches!(c,
        'A'..='Z'
        | 'a'..='z'
        | '\u{00C0}'..='\u{00D6}'
        | '\u{00D8}'..='\u{00F6}'
        | '\u{00F8}'..='\u{02B8}'
        | '\u{0300}'..='\u{0590}'
        | '\u{0800}'..='\u{1FFF}'
        | '\u{200E}'
        | '\u{2C00}'..='\u{FB1C}'
        | '\u{FE00}'..='\u{FE6F}'
        | '\u{FEFD}'..='\u{FFFF}')
}

/// Direction of the first strong character, if any.
pub fn detect(text: &str) -> Option<Direction> {
    text.chars().find_map(|c| {
        if is_rtl(c) {
            Some(Direction::Rtl)
        } else if is_ltr(c) {
            Some(Direction::Ltr)
        } else {
            None
        }
    })
}
