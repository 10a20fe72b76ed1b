// Copyright 2020 The Matrix.org Foundation C.I.C.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The short-code codec: pure functions turning the 5 or
//! 6 bytes the SAS engine derives into the decimal or emoji short
//! authentication string. No cryptographic or I/O concerns live here,
//! only bit-twiddling -- kept separate so it's exhaustively unit and
//! property tested on its own.

/// Three 4-digit decimal numbers, each in `[1000, 9191]`.
pub type Decimal = (u16, u16, u16);

/// Seven 6-bit emoji indices, each in `[0, 63]`.
pub type EmojiIndices = [u8; 7];

/// An emoji and its English description, as the Matrix emoji short
/// authentication string table defines them. The core owns this table
/// because both sides of a verification must agree on it byte-for-byte;
/// only *rendering* the glyph is a UI concern and stays out of scope.
pub type Emoji = (char, &'static str);

/// Turn the first 5 derived bytes into the decimal short authentication
/// string. Returns `None` if fewer than 5 bytes were supplied, rather
/// than treating a short input as an error.
pub fn to_decimal(bytes: &[u8]) -> Option<Decimal> {
    if bytes.len() < 5 {
        return None;
    }

    let b: Vec<u16> = bytes[..5].iter().map(|b| *b as u16).collect();

    let d1 = (b[0] << 5 | b[1] >> 3) + 1000;
    let d2 = ((b[1] & 0x07) << 10 | b[2] << 2 | b[3] >> 6) + 1000;
    let d3 = ((b[3] & 0x3F) << 7 | b[4] >> 1) + 1000;

    Some((d1, d2, d3))
}

/// Turn the first 6 derived bytes into the seven 6-bit emoji indices.
/// Returns `None` if fewer than 6 bytes were supplied.
pub fn to_emoji_indices(bytes: &[u8]) -> Option<EmojiIndices> {
    if bytes.len() < 6 {
        return None;
    }

    let b = &bytes[..6];

    Some([
        (b[0] & 0xFC) >> 2,
        ((b[0] & 0x03) << 4) | ((b[1] & 0xF0) >> 4),
        ((b[1] & 0x0F) << 2) | ((b[2] & 0xC0) >> 6),
        b[2] & 0x3F,
        (b[3] & 0xFC) >> 2,
        ((b[3] & 0x03) << 4) | ((b[4] & 0xF0) >> 4),
        ((b[4] & 0x0F) << 2) | ((b[5] & 0xC0) >> 6),
    ])
}

/// Turn the first 6 derived bytes directly into the seven (emoji,
/// description) pairs.
pub fn to_emoji(bytes: &[u8]) -> Option<[Emoji; 7]> {
    let indices = to_emoji_indices(bytes)?;
    Some([
        emoji_from_index(indices[0]),
        emoji_from_index(indices[1]),
        emoji_from_index(indices[2]),
        emoji_from_index(indices[3]),
        emoji_from_index(indices[4]),
        emoji_from_index(indices[5]),
        emoji_from_index(indices[6]),
    ])
}

/// Look up the emoji and description for one of the 64 indices.
///
/// # Panics
///
/// Panics if `index > 63`; every caller in this crate derives indices
/// with `to_emoji_indices`, which always masks to 6 bits, so this should
/// be unreachable in practice.
pub fn emoji_from_index(index: u8) -> Emoji {
    match index {
        0 => ('🐶', "Dog"),
        1 => ('🐱', "Cat"),
        2 => ('🦁', "Lion"),
        3 => ('🐎', "Horse"),
        4 => ('🦄', "Unicorn"),
        5 => ('🐷', "Pig"),
        6 => ('🐘', "Elephant"),
        7 => ('🐰', "Rabbit"),
        8 => ('🐼', "Panda"),
        9 => ('🐓', "Rooster"),
        10 => ('🐧', "Penguin"),
        11 => ('🐢', "Turtle"),
        12 => ('🐟', "Fish"),
        13 => ('🐙', "Octopus"),
        14 => ('🦋', "Butterfly"),
        15 => ('🌷', "Flower"),
        16 => ('🌳', "Tree"),
        17 => ('🌵', "Cactus"),
        18 => ('🍄', "Mushroom"),
        19 => ('🌏', "Globe"),
        20 => ('🌙', "Moon"),
        21 => ('☁', "Cloud"),
        22 => ('🔥', "Fire"),
        23 => ('🍌', "Banana"),
        24 => ('🍎', "Apple"),
        25 => ('🍓', "Strawberry"),
        26 => ('🌽', "Corn"),
        27 => ('🍕', "Pizza"),
        28 => ('🎂', "Cake"),
        29 => ('❤', "Heart"),
        30 => ('😀', "Smiley"),
        31 => ('🤖', "Robot"),
        32 => ('🎩', "Hat"),
        33 => ('👓', "Glasses"),
        34 => ('🔧', "Spanner"),
        35 => ('🎅', "Santa"),
        36 => ('👍', "Thumbs up"),
        37 => ('☂', "Umbrella"),
        38 => ('⌛', "Hourglass"),
        39 => ('⏰', "Clock"),
        40 => ('🎁', "Gift"),
        41 => ('💡', "Light Bulb"),
        42 => ('📕', "Book"),
        43 => ('✏', "Pencil"),
        44 => ('📎', "Paperclip"),
        45 => ('✂', "Scissors"),
        46 => ('🔒', "Lock"),
        47 => ('🔑', "Key"),
        48 => ('🔨', "Hammer"),
        49 => ('☎', "Telephone"),
        50 => ('🏁', "Flag"),
        51 => ('🚂', "Train"),
        52 => ('🚲', "Bicycle"),
        53 => ('✈', "Airplane"),
        54 => ('🚀', "Rocket"),
        55 => ('🏆', "Trophy"),
        56 => ('⚽', "Ball"),
        57 => ('🎸', "Guitar"),
        58 => ('🎺', "Trumpet"),
        59 => ('🔔', "Bell"),
        60 => ('⚓', "Anchor"),
        61 => ('🎧', "Headphones"),
        62 => ('📁', "Folder"),
        63 => ('📌', "Pin"),
        _ => panic!("emoji index {index} is outside the 64-entry table"),
    }
}
