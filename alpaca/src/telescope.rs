//! Alpaca Telescope (Mount) API implementation

use crate::{AlpacaClient, AlpacaDevice, AlpacaError, RetryConfig, TimeoutConfig};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use telescope_conform::{
    AlignmentMode, AxisRate, DeviceError, DeviceResult, DriveRate, EquatorialSystem, GuideDirection, PierSide,
    Telescope, TelescopeAxis,
};

/// One entry of the AxisRates collection as it travels on the wire
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AxisRateDto {
    minimum: f64,
    maximum: f64,
}

impl From<AxisRateDto> for AxisRate {
    fn from(dto: AxisRateDto) -> Self {
        AxisRate {
            minimum: dto.minimum,
            maximum: dto.maximum,
        }
    }
}

/// Parse the UTCDate string. Servers send ISO 8601 with or without an offset.
pub fn parse_utc_date(value: &str) -> DeviceResult<DateTime<Utc>> {
    if let Ok(date) = DateTime::parse_from_rfc3339(value) {
        return Ok(date.with_timezone(&Utc));
    }
    chrono::NaiveDateTime::parse_from_str(value.trim_end_matches('Z'), "%Y-%m-%dT%H:%M:%S%.f")
        .map(|naive| naive.and_utc())
        .map_err(|e| DeviceError::other(format!("Unable to parse UTCDate '{}': {}", value, e)))
}

pub fn format_utc_date(date: &DateTime<Utc>) -> String {
    date.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Alpaca Telescope (Mount) client
pub struct AlpacaTelescope {
    client: AlpacaClient,
}

impl AlpacaTelescope {
    pub fn new(device: AlpacaDevice) -> Result<Self, AlpacaError> {
        Ok(Self {
            client: AlpacaClient::new(device)?,
        })
    }

    pub fn with_config(
        device: AlpacaDevice,
        timeout_config: TimeoutConfig,
        retry_config: RetryConfig,
    ) -> Result<Self, AlpacaError> {
        Ok(Self {
            client: AlpacaClient::with_config(device, timeout_config, retry_config)?,
        })
    }

    /// Create from server details
    pub fn from_server(base_url: &str, device_number: u32) -> Result<Self, AlpacaError> {
        Self::new(AlpacaDevice::new(base_url, device_number))
    }

    pub fn client(&self) -> &AlpacaClient {
        &self.client
    }

    async fn get<T: DeserializeOwned>(&self, endpoint: &str) -> DeviceResult<T> {
        Ok(self.client.get(endpoint, &[]).await?)
    }

    async fn get_with<T: DeserializeOwned>(&self, endpoint: &str, params: &[(&str, String)]) -> DeviceResult<T> {
        Ok(self.client.get(endpoint, params).await?)
    }

    async fn put(&self, endpoint: &str, params: &[(&str, String)]) -> DeviceResult<()> {
        Ok(self.client.put(endpoint, params).await?)
    }

    async fn put_long(&self, endpoint: &str, params: &[(&str, String)]) -> DeviceResult<()> {
        Ok(self.client.put_long(endpoint, params).await?)
    }

    async fn get_pier_side(&self, endpoint: &str, params: &[(&str, String)]) -> DeviceResult<PierSide> {
        let side: i32 = self.get_with(endpoint, params).await?;
        Ok(PierSide::from_raw(side))
    }
}

fn coordinates(first: (&'static str, f64), second: (&'static str, f64)) -> [(&'static str, String); 2] {
    [(first.0, first.1.to_string()), (second.0, second.1.to_string())]
}

fn axis_param(axis: TelescopeAxis) -> [(&'static str, String); 1] {
    [("Axis", axis.index().to_string())]
}

#[async_trait]
impl Telescope for AlpacaTelescope {
    // Common members

    async fn connected(&self) -> DeviceResult<bool> {
        self.get("connected").await
    }

    async fn set_connected(&self, connected: bool) -> DeviceResult<()> {
        self.put("connected", &[("Connected", connected.to_string())]).await
    }

    async fn name(&self) -> DeviceResult<String> {
        self.get("name").await
    }

    async fn description(&self) -> DeviceResult<String> {
        self.get("description").await
    }

    async fn driver_info(&self) -> DeviceResult<String> {
        self.get("driverinfo").await
    }

    async fn driver_version(&self) -> DeviceResult<String> {
        self.get("driverversion").await
    }

    async fn interface_version(&self) -> DeviceResult<i16> {
        self.get("interfaceversion").await
    }

    async fn supported_actions(&self) -> DeviceResult<Vec<String>> {
        self.get("supportedactions").await
    }

    // Capabilities

    async fn can_find_home(&self) -> DeviceResult<bool> {
        self.get("canfindhome").await
    }

    async fn can_park(&self) -> DeviceResult<bool> {
        self.get("canpark").await
    }

    async fn can_pulse_guide(&self) -> DeviceResult<bool> {
        self.get("canpulseguide").await
    }

    async fn can_set_declination_rate(&self) -> DeviceResult<bool> {
        self.get("cansetdeclinationrate").await
    }

    async fn can_set_guide_rates(&self) -> DeviceResult<bool> {
        self.get("cansetguiderates").await
    }

    async fn can_set_park(&self) -> DeviceResult<bool> {
        self.get("cansetpark").await
    }

    async fn can_set_pier_side(&self) -> DeviceResult<bool> {
        self.get("cansetpierside").await
    }

    async fn can_set_right_ascension_rate(&self) -> DeviceResult<bool> {
        self.get("cansetrightascensionrate").await
    }

    async fn can_set_tracking(&self) -> DeviceResult<bool> {
        self.get("cansettracking").await
    }

    async fn can_slew(&self) -> DeviceResult<bool> {
        self.get("canslew").await
    }

    async fn can_slew_alt_az(&self) -> DeviceResult<bool> {
        self.get("canslewaltaz").await
    }

    async fn can_slew_alt_az_async(&self) -> DeviceResult<bool> {
        self.get("canslewaltazasync").await
    }

    async fn can_slew_async(&self) -> DeviceResult<bool> {
        self.get("canslewasync").await
    }

    async fn can_sync(&self) -> DeviceResult<bool> {
        self.get("cansync").await
    }

    async fn can_sync_alt_az(&self) -> DeviceResult<bool> {
        self.get("cansyncaltaz").await
    }

    async fn can_unpark(&self) -> DeviceResult<bool> {
        self.get("canunpark").await
    }

    async fn can_move_axis(&self, axis: TelescopeAxis) -> DeviceResult<bool> {
        self.get_with("canmoveaxis", &axis_param(axis)).await
    }

    // Properties

    async fn alignment_mode(&self) -> DeviceResult<AlignmentMode> {
        let raw: i32 = self.get("alignmentmode").await?;
        AlignmentMode::from_raw(raw).ok_or_else(|| DeviceError::other(format!("Unrecognised AlignmentMode {}", raw)))
    }

    async fn altitude(&self) -> DeviceResult<f64> {
        self.get("altitude").await
    }

    async fn aperture_area(&self) -> DeviceResult<f64> {
        self.get("aperturearea").await
    }

    async fn aperture_diameter(&self) -> DeviceResult<f64> {
        self.get("aperturediameter").await
    }

    async fn at_home(&self) -> DeviceResult<bool> {
        self.get("athome").await
    }

    async fn at_park(&self) -> DeviceResult<bool> {
        self.get("atpark").await
    }

    async fn azimuth(&self) -> DeviceResult<f64> {
        self.get("azimuth").await
    }

    async fn declination(&self) -> DeviceResult<f64> {
        self.get("declination").await
    }

    async fn declination_rate(&self) -> DeviceResult<f64> {
        self.get("declinationrate").await
    }

    async fn set_declination_rate(&self, rate: f64) -> DeviceResult<()> {
        self.put("declinationrate", &[("DeclinationRate", rate.to_string())]).await
    }

    async fn does_refraction(&self) -> DeviceResult<bool> {
        self.get("doesrefraction").await
    }

    async fn set_does_refraction(&self, value: bool) -> DeviceResult<()> {
        self.put("doesrefraction", &[("DoesRefraction", value.to_string())]).await
    }

    async fn equatorial_system(&self) -> DeviceResult<EquatorialSystem> {
        let raw: i32 = self.get("equatorialsystem").await?;
        EquatorialSystem::from_raw(raw)
            .ok_or_else(|| DeviceError::other(format!("Unrecognised EquatorialSystem {}", raw)))
    }

    async fn focal_length(&self) -> DeviceResult<f64> {
        self.get("focallength").await
    }

    async fn guide_rate_declination(&self) -> DeviceResult<f64> {
        self.get("guideratedeclination").await
    }

    async fn set_guide_rate_declination(&self, rate: f64) -> DeviceResult<()> {
        self.put("guideratedeclination", &[("GuideRateDeclination", rate.to_string())])
            .await
    }

    async fn guide_rate_right_ascension(&self) -> DeviceResult<f64> {
        self.get("guideraterightascension").await
    }

    async fn set_guide_rate_right_ascension(&self, rate: f64) -> DeviceResult<()> {
        self.put("guideraterightascension", &[("GuideRateRightAscension", rate.to_string())])
            .await
    }

    async fn is_pulse_guiding(&self) -> DeviceResult<bool> {
        self.get("ispulseguiding").await
    }

    async fn right_ascension(&self) -> DeviceResult<f64> {
        self.get("rightascension").await
    }

    async fn right_ascension_rate(&self) -> DeviceResult<f64> {
        self.get("rightascensionrate").await
    }

    async fn set_right_ascension_rate(&self, rate: f64) -> DeviceResult<()> {
        self.put("rightascensionrate", &[("RightAscensionRate", rate.to_string())])
            .await
    }

    async fn side_of_pier(&self) -> DeviceResult<PierSide> {
        self.get_pier_side("sideofpier", &[]).await
    }

    async fn set_side_of_pier(&self, side: PierSide) -> DeviceResult<()> {
        self.put_long("sideofpier", &[("SideOfPier", (side as i32).to_string())])
            .await
    }

    async fn sidereal_time(&self) -> DeviceResult<f64> {
        self.get("siderealtime").await
    }

    async fn site_elevation(&self) -> DeviceResult<f64> {
        self.get("siteelevation").await
    }

    async fn set_site_elevation(&self, elevation: f64) -> DeviceResult<()> {
        self.put("siteelevation", &[("SiteElevation", elevation.to_string())]).await
    }

    async fn site_latitude(&self) -> DeviceResult<f64> {
        self.get("sitelatitude").await
    }

    async fn set_site_latitude(&self, latitude: f64) -> DeviceResult<()> {
        self.put("sitelatitude", &[("SiteLatitude", latitude.to_string())]).await
    }

    async fn site_longitude(&self) -> DeviceResult<f64> {
        self.get("sitelongitude").await
    }

    async fn set_site_longitude(&self, longitude: f64) -> DeviceResult<()> {
        self.put("sitelongitude", &[("SiteLongitude", longitude.to_string())]).await
    }

    async fn slewing(&self) -> DeviceResult<bool> {
        self.get("slewing").await
    }

    async fn slew_settle_time(&self) -> DeviceResult<i16> {
        self.get("slewsettletime").await
    }

    async fn set_slew_settle_time(&self, seconds: i16) -> DeviceResult<()> {
        self.put("slewsettletime", &[("SlewSettleTime", seconds.to_string())]).await
    }

    async fn target_declination(&self) -> DeviceResult<f64> {
        self.get("targetdeclination").await
    }

    async fn set_target_declination(&self, dec: f64) -> DeviceResult<()> {
        self.put("targetdeclination", &[("TargetDeclination", dec.to_string())]).await
    }

    async fn target_right_ascension(&self) -> DeviceResult<f64> {
        self.get("targetrightascension").await
    }

    async fn set_target_right_ascension(&self, ra: f64) -> DeviceResult<()> {
        self.put("targetrightascension", &[("TargetRightAscension", ra.to_string())])
            .await
    }

    async fn tracking(&self) -> DeviceResult<bool> {
        self.get("tracking").await
    }

    async fn set_tracking(&self, tracking: bool) -> DeviceResult<()> {
        self.put("tracking", &[("Tracking", tracking.to_string())]).await
    }

    async fn tracking_rate(&self) -> DeviceResult<DriveRate> {
        let raw: i32 = self.get("trackingrate").await?;
        DriveRate::from_raw(raw).ok_or_else(|| DeviceError::other(format!("Unrecognised TrackingRate {}", raw)))
    }

    async fn set_tracking_rate(&self, rate: DriveRate) -> DeviceResult<()> {
        self.put("trackingrate", &[("TrackingRate", (rate as i32).to_string())]).await
    }

    async fn tracking_rates(&self) -> DeviceResult<Vec<DriveRate>> {
        let raw: Vec<i32> = self.get("trackingrates").await?;
        raw.into_iter()
            .map(|r| DriveRate::from_raw(r).ok_or_else(|| DeviceError::other(format!("Unrecognised DriveRate {}", r))))
            .collect()
    }

    async fn utc_date(&self) -> DeviceResult<DateTime<Utc>> {
        let raw: String = self.get("utcdate").await?;
        parse_utc_date(&raw)
    }

    async fn set_utc_date(&self, date: DateTime<Utc>) -> DeviceResult<()> {
        self.put("utcdate", &[("UTCDate", format_utc_date(&date))]).await
    }

    // Methods

    async fn abort_slew(&self) -> DeviceResult<()> {
        self.put("abortslew", &[]).await
    }

    async fn axis_rates(&self, axis: TelescopeAxis) -> DeviceResult<Vec<AxisRate>> {
        let rates: Vec<AxisRateDto> = self.get_with("axisrates", &axis_param(axis)).await?;
        Ok(rates.into_iter().map(AxisRate::from).collect())
    }

    async fn destination_side_of_pier(&self, ra: f64, dec: f64) -> DeviceResult<PierSide> {
        self.get_pier_side(
            "destinationsideofpier",
            &coordinates(("RightAscension", ra), ("Declination", dec)),
        )
        .await
    }

    async fn find_home(&self) -> DeviceResult<()> {
        self.put_long("findhome", &[]).await
    }

    async fn move_axis(&self, axis: TelescopeAxis, rate: f64) -> DeviceResult<()> {
        self.put(
            "moveaxis",
            &[("Axis", axis.index().to_string()), ("Rate", rate.to_string())],
        )
        .await
    }

    async fn park(&self) -> DeviceResult<()> {
        self.put_long("park", &[]).await
    }

    async fn pulse_guide(&self, direction: GuideDirection, duration_ms: i32) -> DeviceResult<()> {
        // synchronous guiders only answer once the pulse is over
        self.put_long(
            "pulseguide",
            &[
                ("Direction", (direction as i32).to_string()),
                ("Duration", duration_ms.to_string()),
            ],
        )
        .await
    }

    async fn set_park(&self) -> DeviceResult<()> {
        self.put("setpark", &[]).await
    }

    async fn slew_to_alt_az(&self, altitude: f64, azimuth: f64) -> DeviceResult<()> {
        self.put_long("slewtoaltaz", &coordinates(("Altitude", altitude), ("Azimuth", azimuth)))
            .await
    }

    async fn slew_to_alt_az_async(&self, altitude: f64, azimuth: f64) -> DeviceResult<()> {
        self.put("slewtoaltazasync", &coordinates(("Altitude", altitude), ("Azimuth", azimuth)))
            .await
    }

    async fn slew_to_coordinates(&self, ra: f64, dec: f64) -> DeviceResult<()> {
        self.put_long(
            "slewtocoordinates",
            &coordinates(("RightAscension", ra), ("Declination", dec)),
        )
        .await
    }

    async fn slew_to_coordinates_async(&self, ra: f64, dec: f64) -> DeviceResult<()> {
        self.put(
            "slewtocoordinatesasync",
            &coordinates(("RightAscension", ra), ("Declination", dec)),
        )
        .await
    }

    async fn slew_to_target(&self) -> DeviceResult<()> {
        self.put_long("slewtotarget", &[]).await
    }

    async fn slew_to_target_async(&self) -> DeviceResult<()> {
        self.put("slewtotargetasync", &[]).await
    }

    async fn sync_to_alt_az(&self, altitude: f64, azimuth: f64) -> DeviceResult<()> {
        self.put("synctoaltaz", &coordinates(("Altitude", altitude), ("Azimuth", azimuth)))
            .await
    }

    async fn sync_to_coordinates(&self, ra: f64, dec: f64) -> DeviceResult<()> {
        self.put(
            "synctocoordinates",
            &coordinates(("RightAscension", ra), ("Declination", dec)),
        )
        .await
    }

    async fn sync_to_target(&self) -> DeviceResult<()> {
        self.put("synctotarget", &[]).await
    }

    async fn unpark(&self) -> DeviceResult<()> {
        self.put("unpark", &[]).await
    }
}
