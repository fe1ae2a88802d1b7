// Candidate tables consumed by the walker phases. Order is significant: entries
// are tried first to last and earlier ones have the better empirical hit rate.

pub const PPSE_NAME: &[u8] = b"2PAY.SYS.DDF01";
pub const PSE_NAME: &[u8] = b"1PAY.SYS.DDF01";

/// Directory names in the order they are selected.
pub fn payment_system_directories(contactless: bool) -> [&'static [u8]; 2] {
    if contactless {
        [PPSE_NAME, PSE_NAME]
    } else {
        [PSE_NAME, PPSE_NAME]
    }
}

pub static INTERNATIONAL_AIDS: [&str; 36] = [
    // Mastercard credit/debit, Maestro, Cirrus
    "A0000000041010",
    "A0000000042203",
    "A0000000042010",
    "A0000000043060",
    "A000000004306001",
    "A0000000041011",
    "A0000000042011",
    "A0000000043061",
    // fintech issued Mastercard variants
    "A0000000651010",
    "A0000006510100",
    // Visa credit/debit, Electron, V PAY, Interlink, Plus
    "A0000000031010",
    "A0000000032010",
    "A0000000032020",
    "A0000000031020",
    "A0000000031040",
    "A0000000033010",
    "A0000000038010",
    "A0000000039010",
    "A0000000031011",
    "A0000000032011",
    // American Express
    "A000000025010801",
    "A000000025010701",
    "A000000025010401",
    // Discover, Interac, PayPal, JCB
    "A0000003591010",
    "A0000000980840",
    "A0000001544442",
    "A0000000650102",
    // regional Mastercard and Visa variants
    "A0000000042202",
    "A0000000042204",
    "A0000000041012",
    "A0000000042012",
    "A0000000042013",
    "A0000000042001",
    "A0000000042002",
    "A0000000041001",
    "A0000000031001",
];

pub static NATIONAL_AIDS: [&str; 14] = [
    // girocard
    "A0000001523010",
    "D27600002545500200",
    "D276000024010204",
    "D276000024010201",
    "D276000024010202",
    "D276000024010203",
    "D27600012401",
    "D2760001240102",
    // Sparkasse
    "A000000359101002",
    "A00000035910100101",
    "A00000035910100102",
    "D276000025455001",
    "D276000025455002",
    "D276000025455003",
];

pub fn default_aid_order() -> Vec<String> {
    INTERNATIONAL_AIDS
        .iter()
        .chain(NATIONAL_AIDS.iter())
        .map(|aid| aid.to_string())
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GpoVariant {
    /// Data objects requested by the card's PDOL, zero filled where unknown.
    Pdol,
    /// `83 00`
    Standard,
    /// No command data at all.
    Empty,
    /// `83 02 00 00`
    Extended,
}

pub static GPO_VARIANTS: [GpoVariant; 4] = [
    GpoVariant::Pdol,
    GpoVariant::Standard,
    GpoVariant::Empty,
    GpoVariant::Extended,
];

// GENERATE AC with canned CDOL data: amount 0.01, EUR (0978), TVR and
// terminal capability bytes. Only provokes a response, never a transaction.
pub static GENERATE_AC_TEMPLATES: [&str; 4] = [
    "80AE40001B0000000100000000000197030000015F2A0209789505008000000000",
    "80AE500018000000010000000000015F2A0209789F020600000000000100",
    "80AE40000B000000010000000000010000",
    "80AE8000159F02060000000000015F2A0209789505808000000000",
];

/// GET DATA probes: (CLA INS P1 P2, tag asked for).
pub static GET_DATA_PROBES: [([u8; 4], &str); 9] = [
    ([0x80, 0xCA, 0x5A, 0x00], "5A"),
    ([0x80, 0xCA, 0x57, 0x00], "57"),
    ([0x80, 0xCA, 0x5F, 0x24], "5F24"),
    ([0x80, 0xCA, 0x9F, 0x6B], "9F6B"),
    ([0x00, 0xCA, 0xDF, 0x20], "DF20"),
    ([0x00, 0xCA, 0xDF, 0x21], "DF21"),
    ([0x00, 0xCA, 0xDF, 0x22], "DF22"),
    ([0x80, 0xCB, 0x5A, 0x00], "5A"),
    ([0x80, 0xCB, 0x57, 0x00], "57"),
];

/// Reader specific UID queries: PC/SC pseudo APDU (with and without Le),
/// PN532 InListPassiveTarget, ISO GET DATA.
pub static UID_COMMANDS: [&[u8]; 4] = [
    &[0xFF, 0xCA, 0x00, 0x00, 0x00],
    &[0xFF, 0xCA, 0x00, 0x00, 0x04],
    &[0xFF, 0x00, 0x00, 0x00, 0x04, 0xD4, 0x4A, 0x01, 0x00],
    &[0x00, 0xCA, 0x00, 0x00, 0x00],
];

pub const UID_MIN_LENGTH: usize = 4;
pub const ATR_MIN_LENGTH: usize = 4;

/// Most productive SFI/record pair first, then the rest of the grid.
pub fn brute_force_grid(max_sfi: u8, max_record: u8) -> Vec<(u8, u8)> {
    let mut grid = Vec::with_capacity(max_sfi as usize * max_record as usize);
    if max_sfi >= 2 && max_record >= 1 {
        grid.push((2, 1));
    }

    for sfi in 1..=max_sfi {
        for record in 1..=max_record {
            if (sfi, record) != (2, 1) {
                grid.push((sfi, record));
            }
        }
    }

    grid
}
