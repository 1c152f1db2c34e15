// Environment configuration
//
// Every variable is read through a lookup function so parsing can be
// exercised without touching the process environment.

use anyhow::{Context, Result, bail};
use maildns_core::config::{
    DomainConfig, MailConfig, ProviderConfig, ProviderSettings, PtrConfig, PtrSettings,
};
use maildns_ip_http::IpDetectorConfig;
use maildns_k8s::ClusterSettings;
use std::collections::HashMap;
use std::net::IpAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

const DEFAULT_SHARED_DIR: &str = "/shared";

/// Everything the CLI needs, read from the environment
#[derive(Debug, Clone)]
pub struct Settings {
    /// Registered DNS provider name
    pub provider_name: String,
    pub provider: ProviderSettings,
    pub ownership: ProviderConfig,
    pub mail: MailConfig,
    pub ptr: PtrConfig,
    /// Backend settings for the configured PTR provider
    pub ptr_settings: Option<PtrSettings>,
    pub ip: IpDetectorConfig,
    pub cluster: ClusterSettings,
    pub watch_interval: Duration,
    pub shared_dir: PathBuf,
}

impl Settings {
    /// Read settings from the process environment
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read settings through `lookup`
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env(lookup);

        let namespace = env.string("NAMESPACE").unwrap_or_else(|| "default".to_string());
        let owner_id = match env.string("DNS_OWNER_ID") {
            Some(owner) => owner,
            None => format!(
                "{}/{}",
                namespace,
                env.string("RELEASE_NAME")
                    .unwrap_or_else(|| "mail-relay".to_string())
            ),
        };

        let ttl: u32 = env.parse("DNS_TTL")?.unwrap_or(300);
        let mut ownership = ProviderConfig::new(owner_id).with_dry_run(env.flag("DNS_DRY_RUN", false)?);
        ownership.default_ttl = ttl;

        let provider_name = env
            .string("DNS_PROVIDER")
            .unwrap_or_else(|| "cloudflare".to_string())
            .to_ascii_lowercase();
        let provider = match provider_name.as_str() {
            "cloudflare" => ProviderSettings::Cloudflare {
                api_token: env.string("CF_API_TOKEN").unwrap_or_default(),
                zone_ids: parse_zone_ids(&env.string("CLOUDFLARE_ZONE_IDS").unwrap_or_default())?,
                proxied: env.flag("CLOUDFLARE_PROXIED", false)?,
                api_base: None,
            },
            other => bail!("DNS_PROVIDER '{}' is not supported. Supported providers: cloudflare", other),
        };

        let mut mail = MailConfig::new(
            env.string("MAIL_HOSTNAME").unwrap_or_default(),
            DomainConfig::parse_list(&env.string("MAIL_DOMAINS").unwrap_or_default()),
        );
        mail.create_a = env.flag("DNS_CREATE_A", true)?;
        mail.create_mx = env.flag("DNS_CREATE_MX", true)?;
        mail.create_spf = env.flag("DNS_CREATE_SPF", true)?;
        mail.create_dkim = env.flag("DNS_CREATE_DKIM", true)?;
        mail.create_dmarc = env.flag("DNS_CREATE_DMARC", true)?;
        if let Some(policy) = env.string("DNS_SPF_POLICY") {
            mail.spf_policy = policy;
        }
        if let Some(policy) = env.string("DNS_DMARC_POLICY") {
            mail.dmarc_policy = policy;
        }
        mail.dmarc_pct = env.parse("DNS_DMARC_PCT")?;
        mail.dmarc_rua = env.string("DNS_DMARC_RUA");
        mail.ttl = ttl;

        let ptr = PtrConfig {
            enabled: env.flag("PTR_ENABLED", false)?,
            provider: env.string("PTR_PROVIDER").map(|p| p.to_ascii_lowercase()),
            hostname: env.string("PTR_HOSTNAME"),
        };
        let ptr_settings = match ptr.provider.as_deref() {
            Some("hetzner" | "hetzner-cloud") => Some(PtrSettings::HetznerCloud {
                api_token: env.string("HETZNER_API_TOKEN").unwrap_or_default(),
                api_base: None,
            }),
            Some("hetzner-robot") => Some(PtrSettings::HetznerRobot {
                username: env.string("HETZNER_ROBOT_USERNAME").unwrap_or_default(),
                password: env.string("HETZNER_ROBOT_PASSWORD").unwrap_or_default(),
                api_base: None,
            }),
            Some(other) if ptr.enabled => bail!(
                "PTR_PROVIDER '{}' is not supported. Supported providers: hetzner, hetzner-cloud, hetzner-robot",
                other
            ),
            _ => None,
        };

        let mut ip = IpDetectorConfig {
            static_ips: parse_ip_list(&env.string("STATIC_IPS").unwrap_or_default())?,
            detect_outbound: env.flag("DETECT_OUTBOUND_IP", true)?,
            ..IpDetectorConfig::default()
        };
        if let Some(apis) = env.string("IP_DETECTION_APIS") {
            let apis = split_list(&apis);
            if !apis.is_empty() {
                ip.external_apis = apis;
            }
        }
        if let Some(timeout) = env.parse("IP_DETECTION_TIMEOUT")? {
            ip.timeout_secs = timeout;
        }

        let cluster = ClusterSettings {
            namespace,
            service_name: env.string("SERVICE_NAME").unwrap_or_default(),
            pod_name: env.string("POD_NAME").or_else(|| env.string("HOSTNAME")),
        };

        let watch_interval = Duration::from_secs(env.parse("DNS_WATCHER_INTERVAL")?.unwrap_or(60));
        let shared_dir = PathBuf::from(
            env.string("SHARED_DIR")
                .unwrap_or_else(|| DEFAULT_SHARED_DIR.to_string()),
        );

        Ok(Self {
            provider_name,
            provider,
            ownership,
            mail,
            ptr,
            ptr_settings,
            ip,
            cluster,
            watch_interval,
            shared_dir,
        })
    }

    /// Validate everything a reconciliation run depends on
    pub fn validate(&self) -> Result<()> {
        self.ownership.validate().context("Invalid ownership settings")?;
        self.provider.validate().context("Invalid DNS provider settings")?;
        self.mail.validate().context("Invalid mail settings (MAIL_HOSTNAME, MAIL_DOMAINS)")?;
        if self.ptr.enabled
            && let Some(settings) = &self.ptr_settings
        {
            settings.validate().context("Invalid PTR provider settings")?;
        }
        if self.watch_interval.is_zero() {
            bail!("DNS_WATCHER_INTERVAL must be at least 1 second");
        }
        Ok(())
    }
}

/// Typed access to the lookup function
struct Env<F>(F);

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    /// Trimmed, non-empty value
    fn string(&self, key: &str) -> Option<String> {
        (self.0)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn parse<T>(&self, key: &str) -> Result<Option<T>>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.string(key) {
            Some(raw) => raw
                .parse()
                .map(Some)
                .map_err(|e| anyhow::anyhow!("{} has an invalid value '{}': {}", key, raw, e)),
            None => Ok(None),
        }
    }

    fn flag(&self, key: &str, default: bool) -> Result<bool> {
        match self.string(key) {
            None => Ok(default),
            Some(raw) => match raw.to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" | "on" => Ok(true),
                "false" | "0" | "no" | "off" => Ok(false),
                _ => bail!("{} must be true or false, got '{}'", key, raw),
            },
        }
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Parse `domain:zone_id` pairs separated by commas
pub fn parse_zone_ids(raw: &str) -> Result<HashMap<String, String>> {
    split_list(raw)
        .into_iter()
        .map(|pair| match pair.split_once(':') {
            Some((domain, zone)) if !domain.trim().is_empty() && !zone.trim().is_empty() => {
                Ok((domain.trim().to_string(), zone.trim().to_string()))
            }
            _ => bail!("CLOUDFLARE_ZONE_IDS entry '{}' must be domain:zone_id", pair),
        })
        .collect()
}

/// Parse a comma-separated address list
pub fn parse_ip_list(raw: &str) -> Result<Vec<IpAddr>> {
    split_list(raw)
        .into_iter()
        .map(|ip| {
            ip.parse::<IpAddr>()
                .with_context(|| format!("STATIC_IPS entry '{}' is not an IP address", ip))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(vars: &[(&str, &str)]) -> Result<Settings> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Settings::from_lookup(|key| vars.get(key).cloned())
    }

    fn minimal() -> Vec<(&'static str, &'static str)> {
        vec![
            ("CF_API_TOKEN", "cf-token"),
            ("MAIL_HOSTNAME", "mail.ex.com"),
            ("MAIL_DOMAINS", "ex.com"),
        ]
    }

    #[test]
    fn defaults() {
        let s = settings(&minimal()).unwrap();
        s.validate().unwrap();

        assert_eq!(s.provider_name, "cloudflare");
        assert_eq!(s.ownership.owner_id, "default/mail-relay");
        assert_eq!(s.ownership.default_ttl, 300);
        assert!(!s.ownership.dry_run);
        assert_eq!(s.mail.domains, vec![DomainConfig::new("ex.com")]);
        assert!(s.mail.create_dkim);
        assert_eq!(s.mail.spf_policy, "~all");
        assert!(!s.ptr.enabled);
        assert!(s.ptr_settings.is_none());
        assert!(s.ip.static_ips.is_empty());
        assert_eq!(s.watch_interval, Duration::from_secs(60));
        assert_eq!(s.shared_dir, PathBuf::from("/shared"));
    }

    #[test]
    fn owner_id_from_namespace_and_release() {
        let mut vars = minimal();
        vars.push(("NAMESPACE", "mail"));
        vars.push(("RELEASE_NAME", "relay-prod"));
        assert_eq!(settings(&vars).unwrap().ownership.owner_id, "mail/relay-prod");

        vars.push(("DNS_OWNER_ID", "explicit"));
        assert_eq!(settings(&vars).unwrap().ownership.owner_id, "explicit");
    }

    #[test]
    fn mail_options() {
        let mut vars = minimal();
        vars.retain(|(k, _)| *k != "MAIL_DOMAINS");
        vars.extend([
            ("MAIL_DOMAINS", r#"[{"name": "ex.com", "dkimSelector": "s1"}, {"name": "ex.org"}]"#),
            ("DNS_CREATE_MX", "false"),
            ("DNS_DMARC_POLICY", "quarantine"),
            ("DNS_DMARC_PCT", "50"),
            ("DNS_DMARC_RUA", "mailto:dmarc@ex.com"),
            ("DNS_TTL", "120"),
        ]);
        let s = settings(&vars).unwrap();

        assert_eq!(
            s.mail.domains,
            vec![DomainConfig::new("ex.com").with_selector("s1"), DomainConfig::new("ex.org")]
        );
        assert!(!s.mail.create_mx);
        assert_eq!(s.mail.dmarc_policy, "quarantine");
        assert_eq!(s.mail.dmarc_pct, Some(50));
        assert_eq!(s.mail.dmarc_rua.as_deref(), Some("mailto:dmarc@ex.com"));
        assert_eq!(s.mail.ttl, 120);
        assert_eq!(s.ownership.default_ttl, 120);
    }

    #[test]
    fn cloudflare_zone_ids() {
        let mut vars = minimal();
        vars.push(("CLOUDFLARE_ZONE_IDS", "ex.com:zone1, ex.org:zone2"));
        vars.push(("CLOUDFLARE_PROXIED", "true"));

        let ProviderSettings::Cloudflare {
            zone_ids, proxied, ..
        } = settings(&vars).unwrap().provider;
        assert_eq!(zone_ids.get("ex.com").map(String::as_str), Some("zone1"));
        assert_eq!(zone_ids.get("ex.org").map(String::as_str), Some("zone2"));
        assert!(proxied);

        assert!(parse_zone_ids("ex.com").is_err());
    }

    #[test]
    fn ptr_providers() {
        let mut vars = minimal();
        vars.extend([
            ("PTR_ENABLED", "true"),
            ("PTR_PROVIDER", "Hetzner-Robot"),
            ("HETZNER_ROBOT_USERNAME", "user"),
            ("HETZNER_ROBOT_PASSWORD", "pass"),
        ]);
        let s = settings(&vars).unwrap();
        s.validate().unwrap();
        assert_eq!(s.ptr.provider.as_deref(), Some("hetzner-robot"));
        assert!(matches!(s.ptr_settings, Some(PtrSettings::HetznerRobot { .. })));

        let mut vars = minimal();
        vars.extend([("PTR_ENABLED", "true"), ("PTR_PROVIDER", "hetzner")]);
        let s = settings(&vars).unwrap();
        assert!(matches!(s.ptr_settings, Some(PtrSettings::HetznerCloud { .. })));
        assert!(s.validate().is_err(), "missing Hetzner token");

        let mut vars = minimal();
        vars.extend([("PTR_ENABLED", "true"), ("PTR_PROVIDER", "ovh")]);
        assert!(settings(&vars).is_err());
    }

    #[test]
    fn ip_detection() {
        let mut vars = minimal();
        vars.extend([
            ("STATIC_IPS", "1.2.3.4, 2001:db8::1"),
            ("IP_DETECTION_APIS", "https://a.example/ip,https://b.example/ip"),
            ("DETECT_OUTBOUND_IP", "false"),
            ("IP_DETECTION_TIMEOUT", "5"),
        ]);
        let s = settings(&vars).unwrap();

        assert_eq!(
            s.ip.static_ips,
            vec!["1.2.3.4".parse::<IpAddr>().unwrap(), "2001:db8::1".parse().unwrap()]
        );
        assert_eq!(s.ip.external_apis.len(), 2);
        assert!(!s.ip.detect_outbound);
        assert_eq!(s.ip.timeout_secs, 5);

        assert!(parse_ip_list("1.2.3.4,not-an-ip").is_err());
    }

    #[test]
    fn pod_name_falls_back_to_hostname() {
        let mut vars = minimal();
        vars.push(("HOSTNAME", "relay-0"));
        assert_eq!(settings(&vars).unwrap().cluster.pod_name.as_deref(), Some("relay-0"));

        vars.push(("POD_NAME", "relay-1"));
        assert_eq!(settings(&vars).unwrap().cluster.pod_name.as_deref(), Some("relay-1"));
    }

    #[test]
    fn invalid_values_are_reported() {
        let mut vars = minimal();
        vars.push(("DNS_TTL", "soon"));
        let err = settings(&vars).unwrap_err();
        assert!(err.to_string().contains("DNS_TTL"));

        let mut vars = minimal();
        vars.push(("DNS_DRY_RUN", "maybe"));
        assert!(settings(&vars).is_err());

        let mut vars = minimal();
        vars.push(("DNS_PROVIDER", "route53"));
        assert!(settings(&vars).is_err());
    }

    #[test]
    fn missing_mail_settings_fail_validation() {
        let s = settings(&[("CF_API_TOKEN", "cf-token")]).unwrap();
        assert!(s.validate().is_err());
    }
}
