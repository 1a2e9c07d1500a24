//! Fixed catalogs the generator draws from.
//!
//! Every entry is internally consistent: a model lists the OS API range it
//! actually shipped with and the 8-digit type allocation code used as the
//! prefix of its hardware serial; a region ties locale, timezone and carrier
//! to one country and its mobile country code.

/// One hardware model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceModel {
    pub manufacturer: &'static str,
    pub brand: &'static str,
    pub model: &'static str,
    pub device: &'static str,
    pub board: &'static str,
    pub hardware: &'static str,
    pub cpu_abi: &'static str,
    pub tac: &'static str,
    pub min_api: u32,
    pub max_api: u32,
}

/// One OS release.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OsRelease {
    pub release: &'static str,
    pub api_level: u32,
    pub build_prefix: &'static str,
    pub security_patch: &'static str,
}

/// One locale/network region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    pub language: &'static str,
    pub country: &'static str,
    pub timezone: &'static str,
    pub carrier: &'static str,
    pub mcc: &'static str,
    pub mnc: &'static str,
}

impl Region {
    pub fn locale(&self) -> String {
        format!("{}_{}", self.language, self.country)
    }
}

pub const DEVICES: &[DeviceModel] = &[
    DeviceModel {
        manufacturer: "samsung",
        brand: "samsung",
        model: "SM-G991B",
        device: "o1s",
        board: "exynos2100",
        hardware: "exynos2100",
        cpu_abi: "arm64-v8a",
        tac: "35291811",
        min_api: 30,
        max_api: 34,
    },
    DeviceModel {
        manufacturer: "samsung",
        brand: "samsung",
        model: "SM-S901B",
        device: "r0s",
        board: "s5e9925",
        hardware: "s5e9925",
        cpu_abi: "arm64-v8a",
        tac: "35066645",
        min_api: 31,
        max_api: 34,
    },
    DeviceModel {
        manufacturer: "samsung",
        brand: "samsung",
        model: "SM-A525F",
        device: "a52q",
        board: "atoll",
        hardware: "qcom",
        cpu_abi: "arm64-v8a",
        tac: "35474312",
        min_api: 30,
        max_api: 34,
    },
    DeviceModel {
        manufacturer: "Google",
        brand: "google",
        model: "Pixel 6",
        device: "oriole",
        board: "oriole",
        hardware: "oriole",
        cpu_abi: "arm64-v8a",
        tac: "35591133",
        min_api: 31,
        max_api: 34,
    },
    DeviceModel {
        manufacturer: "Google",
        brand: "google",
        model: "Pixel 7",
        device: "panther",
        board: "panther",
        hardware: "panther",
        cpu_abi: "arm64-v8a",
        tac: "35684610",
        min_api: 33,
        max_api: 34,
    },
    DeviceModel {
        manufacturer: "Google",
        brand: "google",
        model: "Pixel 4a",
        device: "sunfish",
        board: "sunfish",
        hardware: "sunfish",
        cpu_abi: "arm64-v8a",
        tac: "35308511",
        min_api: 29,
        max_api: 33,
    },
    DeviceModel {
        manufacturer: "OnePlus",
        brand: "OnePlus",
        model: "LE2113",
        device: "OnePlus9",
        board: "lahaina",
        hardware: "qcom",
        cpu_abi: "arm64-v8a",
        tac: "86497805",
        min_api: 30,
        max_api: 33,
    },
    DeviceModel {
        manufacturer: "Xiaomi",
        brand: "Xiaomi",
        model: "M2011K2G",
        device: "venus",
        board: "lahaina",
        hardware: "qcom",
        cpu_abi: "arm64-v8a",
        tac: "86153705",
        min_api: 30,
        max_api: 33,
    },
    DeviceModel {
        manufacturer: "Xiaomi",
        brand: "Redmi",
        model: "M2101K7AG",
        device: "mojito",
        board: "sm6150",
        hardware: "qcom",
        cpu_abi: "arm64-v8a",
        tac: "86886205",
        min_api: 30,
        max_api: 33,
    },
    DeviceModel {
        manufacturer: "motorola",
        brand: "motorola",
        model: "moto g(60)",
        device: "hanoip",
        board: "sm6150",
        hardware: "qcom",
        cpu_abi: "arm64-v8a",
        tac: "35175612",
        min_api: 30,
        max_api: 32,
    },
];

pub const OS_RELEASES: &[OsRelease] = &[
    OsRelease {
        release: "10",
        api_level: 29,
        build_prefix: "QQ3A",
        security_patch: "2021-08-01",
    },
    OsRelease {
        release: "11",
        api_level: 30,
        build_prefix: "RQ3A",
        security_patch: "2022-03-05",
    },
    OsRelease {
        release: "12",
        api_level: 31,
        build_prefix: "SQ1D",
        security_patch: "2022-10-05",
    },
    OsRelease {
        release: "12L",
        api_level: 32,
        build_prefix: "SQ3A",
        security_patch: "2023-02-05",
    },
    OsRelease {
        release: "13",
        api_level: 33,
        build_prefix: "TQ3A",
        security_patch: "2023-09-05",
    },
    OsRelease {
        release: "14",
        api_level: 34,
        build_prefix: "UQ1A",
        security_patch: "2024-03-05",
    },
];

pub const REGIONS: &[Region] = &[
    Region {
        language: "en",
        country: "US",
        timezone: "America/New_York",
        carrier: "Verizon",
        mcc: "311",
        mnc: "480",
    },
    Region {
        language: "en",
        country: "US",
        timezone: "America/Los_Angeles",
        carrier: "T-Mobile",
        mcc: "310",
        mnc: "260",
    },
    Region {
        language: "en",
        country: "US",
        timezone: "America/Chicago",
        carrier: "AT&T",
        mcc: "310",
        mnc: "410",
    },
    Region {
        language: "en",
        country: "GB",
        timezone: "Europe/London",
        carrier: "EE",
        mcc: "234",
        mnc: "30",
    },
    Region {
        language: "en",
        country: "GB",
        timezone: "Europe/London",
        carrier: "O2",
        mcc: "234",
        mnc: "10",
    },
    Region {
        language: "de",
        country: "DE",
        timezone: "Europe/Berlin",
        carrier: "Telekom.de",
        mcc: "262",
        mnc: "01",
    },
    Region {
        language: "fr",
        country: "FR",
        timezone: "Europe/Paris",
        carrier: "Orange F",
        mcc: "208",
        mnc: "01",
    },
    Region {
        language: "hi",
        country: "IN",
        timezone: "Asia/Kolkata",
        carrier: "Jio",
        mcc: "405",
        mnc: "857",
    },
    Region {
        language: "ja",
        country: "JP",
        timezone: "Asia/Tokyo",
        carrier: "NTT DOCOMO",
        mcc: "440",
        mnc: "10",
    },
    Region {
        language: "en",
        country: "AU",
        timezone: "Australia/Sydney",
        carrier: "Telstra",
        mcc: "505",
        mnc: "01",
    },
];

/// OS releases a model can plausibly run.
pub fn releases_for(device: &DeviceModel) -> Vec<&'static OsRelease> {
    OS_RELEASES
        .iter()
        .filter(|r| (device.min_api..=device.max_api).contains(&r.api_level))
        .collect()
}

/// Look up a model by its model string.
pub fn find_device(model: &str) -> Option<&'static DeviceModel> {
    DEVICES.iter().find(|d| d.model == model)
}
