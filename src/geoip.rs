//! GeoIP lookup wrapper. The core only depends on the `lookup(ip) -> (province, city)`
//! contract described in the spec; the mmdb format and its own crate
//! (`maxminddb`) are an external collaborator, enriched in from the
//! platform's other ingestion services that carry GeoIP as an optional
//! feature.

use std::net::IpAddr;

use tracing::debug;

use crate::errors::Result;

pub struct GeoIp {
    reader: maxminddb::Reader<Vec<u8>>,
}

impl GeoIp {
    pub fn open(mmdb_path: &str) -> Result<Self> {
        let reader = maxminddb::Reader::open_readfile(mmdb_path)?;
        Ok(Self { reader })
    }

    /// Looks up `(province, city)` for `ip`. Returns `None` on a miss or a
    /// malformed address — the Enricher logs at debug and proceeds without
    /// geo fields in that case, per spec.
    pub fn lookup(&self, ip: &str) -> Option<(String, String)> {
        let addr: IpAddr = ip.parse().ok()?;
        let record: maxminddb::geoip2::City = match self.reader.lookup(addr) {
            Ok(r) => r,
            Err(e) => {
                debug!("geoip lookup miss for {ip}: {e}");
                return None;
            }
        };

        let province = record
            .subdivisions
            .as_ref()
            .and_then(|subs| subs.first())
            .and_then(|s| s.names.as_ref())
            .and_then(|names| names.get("en").or_else(|| names.values().next()))
            .map(|s| s.to_string())
            .unwrap_or_default();

        let city = record
            .city
            .as_ref()
            .and_then(|c| c.names.as_ref())
            .and_then(|names| names.get("en").or_else(|| names.values().next()))
            .map(|s| s.to_string())
            .unwrap_or_default();

        Some((province, city))
    }
}
