//! TLS settings for corporate networks and the `--diagnose-tls` report.
//!
//! Verification is controlled by environment variables:
//! * `ANVIL_SSL_VERIFY` set to `false`, `0`, `no` or `off` disables it.
//! * `SSL_CERT_FILE` or `REQUESTS_CA_BUNDLE` names an extra CA bundle.

use std::fmt;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::warn;

pub const VERIFY_VAR: &str = "ANVIL_SSL_VERIFY";
pub const CERT_FILE_VAR: &str = "SSL_CERT_FILE";
pub const CA_BUNDLE_VAR: &str = "REQUESTS_CA_BUNDLE";

const BEGIN_MARKER: &str = "-----BEGIN CERTIFICATE-----";
const END_MARKER: &str = "-----END CERTIFICATE-----";

const LINUX_BUNDLES: [&str; 4] = [
    "/etc/ssl/certs/ca-certificates.crt",
    "/etc/pki/tls/certs/ca-bundle.crt",
    "/etc/ssl/ca-bundle.pem",
    "/etc/pki/ca-trust/extracted/pem/tls-ca-bundle.pem",
];

const TLS_KEYWORDS: [&str; 8] = [
    "ssl",
    "tls",
    "certificate",
    "cert",
    "handshake",
    "verify",
    "unknownissuer",
    "self signed",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TlsVerify {
    /// Platform roots only.
    Default,
    /// Certificates are not checked at all.
    Disabled,
    /// Platform roots plus the certificates of this PEM bundle.
    CaBundle(PathBuf),
}

#[derive(Debug, Error)]
pub enum TlsError {
    #[error("cannot read CA bundle {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid CA bundle {path}: {source}")]
    Parse {
        path: PathBuf,
        source: reqwest::Error,
    },
    #[error("cannot build HTTP client: {0}")]
    Client(#[source] reqwest::Error),
}

fn is_disabled(value: &str) -> bool {
    matches!(value.to_lowercase().as_str(), "false" | "0" | "no" | "off")
}

impl TlsVerify {
    pub fn from_env() -> Self {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Resolves the setting from `lookup`. A bundle path that does not
    /// exist is ignored.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        if lookup(VERIFY_VAR).is_some_and(|value| is_disabled(&value)) {
            warn!("TLS verification is disabled via {VERIFY_VAR}; only use this for testing");
            return Self::Disabled;
        }

        lookup(CERT_FILE_VAR)
            .filter(|path| !path.is_empty())
            .or_else(|| lookup(CA_BUNDLE_VAR).filter(|path| !path.is_empty()))
            .map(PathBuf::from)
            .filter(|path| path.exists())
            .map_or(Self::Default, Self::CaBundle)
    }

    /// Applies the setting to a reqwest client under construction.
    ///
    /// # Errors
    /// Fails if the CA bundle cannot be read or parsed.
    pub fn configure(&self, builder: reqwest::ClientBuilder) -> Result<reqwest::ClientBuilder, TlsError> {
        match self {
            Self::Default => Ok(builder),
            Self::Disabled => Ok(builder.danger_accept_invalid_certs(true)),
            Self::CaBundle(path) => {
                let pem = std::fs::read(path).map_err(|source| TlsError::Read {
                    path: path.clone(),
                    source,
                })?;
                let certificates =
                    reqwest::Certificate::from_pem_bundle(&pem).map_err(|source| TlsError::Parse {
                        path: path.clone(),
                        source,
                    })?;
                Ok(certificates
                    .into_iter()
                    .fold(builder, reqwest::ClientBuilder::add_root_certificate))
            }
        }
    }
}

/// Result of inspecting a CA bundle file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BundleInfo {
    pub path: PathBuf,
    pub exists: bool,
    pub readable: bool,
    pub valid_pem: bool,
    pub cert_count: usize,
    pub error: Option<String>,
}

pub fn analyze_bundle(path: &Path) -> BundleInfo {
    let mut info = BundleInfo {
        path: path.to_path_buf(),
        ..BundleInfo::default()
    };

    if !path.exists() {
        info.error = Some(format!("File does not exist: {}", path.display()));
        return info;
    }
    info.exists = true;

    let content = match std::fs::read(path) {
        Ok(content) => content,
        Err(err) => {
            info.error = Some(format!("Cannot read file: {err}"));
            return info;
        }
    };
    info.readable = true;

    let text = String::from_utf8_lossy(&content);
    let begin = text.matches(BEGIN_MARKER).count();
    let end = text.matches(END_MARKER).count();

    if begin == 0 {
        info.error = Some("File does not contain any PEM certificates".into());
    } else if begin != end {
        info.error = Some(format!(
            "Malformed PEM: {begin} BEGIN markers but {end} END markers"
        ));
    } else {
        info.valid_pem = true;
        info.cert_count = begin;
    }
    info
}

/// Whether an error message looks like a certificate or handshake problem.
pub fn is_tls_error(message: &str) -> bool {
    let message = message.to_lowercase();
    TLS_KEYWORDS.iter().any(|keyword| message.contains(keyword))
}

/// Environment and bundle checks with advice for fixing them.
#[derive(Debug, Clone, Default)]
pub struct TlsDiagnostics {
    pub ssl_cert_file: Option<String>,
    pub requests_ca_bundle: Option<String>,
    pub ssl_verify: Option<String>,
    pub bundle: Option<BundleInfo>,
    pub system: &'static str,
    pub test_host: String,
    /// Outcome of a test request, when one was made.
    pub connection: Option<Result<(), String>>,
    pub issues: Vec<String>,
    pub recommendations: Vec<String>,
}

impl TlsDiagnostics {
    pub fn from_env(test_host: impl Into<String>) -> Self {
        Self::from_lookup(test_host, |var| std::env::var(var).ok())
    }

    pub fn from_lookup(test_host: impl Into<String>, lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut diag = Self {
            ssl_cert_file: lookup(CERT_FILE_VAR),
            requests_ca_bundle: lookup(CA_BUNDLE_VAR),
            ssl_verify: lookup(VERIFY_VAR),
            system: std::env::consts::OS,
            test_host: test_host.into(),
            ..Self::default()
        };

        let ca_file = diag
            .ssl_cert_file
            .clone()
            .or_else(|| diag.requests_ca_bundle.clone());

        match &ca_file {
            Some(path) => {
                let info = analyze_bundle(Path::new(path));
                if !info.exists {
                    diag.issues.push(format!("Certificate file does not exist: {path}"));
                    diag.recommendations
                        .push(format!("Create or update the certificate file at: {path}"));
                } else if !info.readable {
                    diag.issues.push(format!("Cannot read certificate file: {path}"));
                    diag.recommendations.push(format!("Check permissions on: {path}"));
                } else if !info.valid_pem {
                    diag.issues.push(format!(
                        "Invalid certificate format: {}",
                        info.error.as_deref().unwrap_or("unknown error")
                    ));
                    diag.recommendations
                        .push("Ensure the file contains valid PEM-formatted certificates".into());
                }
                diag.bundle = Some(info);
            }
            None => diag
                .issues
                .push(format!("No custom CA bundle configured ({CERT_FILE_VAR} or {CA_BUNDLE_VAR})")),
        }

        if diag.system == "macos" {
            let export = home_bundle_path();
            diag.recommendations.push(format!(
                "On macOS, export your system certificates:\n   security export -t certs -f pemseq -k /Library/Keychains/System.keychain -o {}\n   export {CERT_FILE_VAR}={}",
                export.display(),
                export.display()
            ));
        } else if diag.system == "linux"
            && ca_file.is_none()
            && let Some(path) = LINUX_BUNDLES.iter().find(|path| Path::new(path).exists())
        {
            diag.recommendations.push(format!(
                "Try using your system CA bundle:\n   export {CERT_FILE_VAR}={path}"
            ));
        }

        if diag.recommendations.is_empty() {
            if diag.ssl_verify.as_deref().is_some_and(is_disabled) {
                diag.recommendations.push(
                    "TLS verification is currently disabled. This works but is insecure.".into(),
                );
            } else {
                diag.recommendations
                    .push("Contact your IT department for the corporate CA certificate bundle".into());
            }
        }
        diag
    }

    /// Records the result of a test connection and explains known failures.
    pub fn record_connection(&mut self, result: Result<(), String>) {
        if let Err(message) = &result {
            let lower = message.to_lowercase();
            if lower.contains("unknownissuer") || lower.contains("unable to get local issuer") {
                self.issues
                    .push("Missing intermediate or root CA certificate in chain".into());
            } else if lower.contains("self signed") || lower.contains("self-signed") {
                self.issues
                    .push("Self-signed certificate in chain (common with corporate proxies)".into());
                self.recommendations.push(
                    "Your corporate proxy likely uses a self-signed CA. Export it from your system keychain."
                        .into(),
                );
            } else if lower.contains("expired") {
                self.issues.push("A certificate in the chain has expired".into());
                self.recommendations
                    .push("Contact your IT department - a certificate needs renewal".into());
            }
        }
        self.connection = Some(result);
    }
}

fn home_bundle_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_default()
        .join("anvil-ca-bundle.pem")
}

fn or_unset(value: Option<&String>) -> &str {
    value.map_or("(not set)", String::as_str)
}

const fn yes_no(value: bool) -> &'static str {
    if value { "Yes" } else { "No" }
}

impl fmt::Display for TlsDiagnostics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rule = "=".repeat(60);
        writeln!(f, "{rule}\nTLS DIAGNOSTICS\n{rule}\n")?;

        writeln!(f, "Environment Variables:")?;
        writeln!(f, "  {CERT_FILE_VAR}:      {}", or_unset(self.ssl_cert_file.as_ref()))?;
        writeln!(f, "  {CA_BUNDLE_VAR}: {}", or_unset(self.requests_ca_bundle.as_ref()))?;
        writeln!(f, "  {VERIFY_VAR}:   {}", or_unset(self.ssl_verify.as_ref()))?;
        writeln!(f)?;

        if let Some(bundle) = &self.bundle {
            writeln!(f, "Certificate File Analysis:")?;
            writeln!(f, "  Path: {}", bundle.path.display())?;
            writeln!(f, "  Exists: {}", yes_no(bundle.exists))?;
            if bundle.exists {
                writeln!(f, "  Readable: {}", yes_no(bundle.readable))?;
            }
            if bundle.readable {
                writeln!(f, "  Valid PEM: {}", yes_no(bundle.valid_pem))?;
            }
            if bundle.valid_pem {
                writeln!(f, "  Certificate count: {}", bundle.cert_count)?;
            }
            if let Some(error) = &bundle.error {
                writeln!(f, "  Error: {error}")?;
            }
            writeln!(f)?;
        }

        if let Some(connection) = &self.connection {
            writeln!(f, "Connection Test ({}):", self.test_host)?;
            match connection {
                Ok(()) => writeln!(f, "  Connection: SUCCESS")?,
                Err(error) => writeln!(f, "  Connection: FAILED\n  Error: {error}")?,
            }
            writeln!(f)?;
        }

        if !self.issues.is_empty() {
            writeln!(f, "Issues Found:")?;
            for issue in &self.issues {
                writeln!(f, "  - {issue}")?;
            }
            writeln!(f)?;
        }

        writeln!(f, "{rule}\nRECOMMENDATIONS\n{rule}\n")?;
        for (i, recommendation) in self.recommendations.iter().enumerate() {
            writeln!(f, "{}. {recommendation}\n", i + 1)?;
        }

        writeln!(f, "Last Resort (NOT recommended for production):")?;
        writeln!(f, "  export {VERIFY_VAR}=false")
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::io::Write;

    use tempfile::NamedTempFile;

    use super::*;

    const SAMPLE_PEM: &str = "-----BEGIN CERTIFICATE-----\nMIIBkTCB+wIJAKHBfpegPjMCMA0GCSqGSIb3DQEBCwUAMBExDzANBgNVBAMMBnRl\n-----END CERTIFICATE-----\n";

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |var| vars.get(var).cloned()
    }

    fn bundle(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_verify_defaults() {
        assert_eq!(TlsVerify::from_lookup(lookup(&[])), TlsVerify::Default);
    }

    #[test]
    fn test_verify_disabled_values() {
        for value in ["false", "0", "no", "off", "FALSE", "NO"] {
            let verify = TlsVerify::from_lookup(lookup(&[(VERIFY_VAR, value)]));
            assert_eq!(verify, TlsVerify::Disabled, "value {value}");
        }
        assert_eq!(
            TlsVerify::from_lookup(lookup(&[(VERIFY_VAR, "true")])),
            TlsVerify::Default
        );
    }

    #[test]
    fn test_verify_uses_existing_bundle() {
        let file = bundle(SAMPLE_PEM);
        let path = file.path().to_str().unwrap();

        let verify = TlsVerify::from_lookup(lookup(&[(CA_BUNDLE_VAR, path)]));
        assert_eq!(verify, TlsVerify::CaBundle(file.path().to_path_buf()));

        let missing = TlsVerify::from_lookup(lookup(&[(CERT_FILE_VAR, "/nonexistent/ca.pem")]));
        assert_eq!(missing, TlsVerify::Default);
    }

    #[test]
    fn test_analyze_bundle() {
        let missing = analyze_bundle(Path::new("/nonexistent/ca.pem"));
        assert!(!missing.exists);
        assert!(missing.error.unwrap().contains("does not exist"));

        let valid = analyze_bundle(bundle(&SAMPLE_PEM.repeat(2)).path());
        assert!(valid.valid_pem);
        assert_eq!(valid.cert_count, 2);
        assert_eq!(valid.error, None);

        let garbage = analyze_bundle(bundle("not a certificate").path());
        assert!(garbage.readable);
        assert!(!garbage.valid_pem);
        assert!(garbage.error.unwrap().contains("does not contain any PEM"));

        let truncated = analyze_bundle(bundle("-----BEGIN CERTIFICATE-----\nabc").path());
        assert!(truncated.error.unwrap().contains("Malformed PEM"));
    }

    #[test]
    fn test_diagnostics_report() {
        let diag = TlsDiagnostics::from_lookup("example.com", lookup(&[]));
        assert!(diag.issues.iter().any(|issue| issue.contains("No custom CA bundle")));
        assert!(!diag.recommendations.is_empty());

        let diag = TlsDiagnostics::from_lookup(
            "example.com",
            lookup(&[(CERT_FILE_VAR, "/test/path.pem")]),
        );
        let report = diag.to_string();
        assert!(report.contains("/test/path.pem"));
        assert!(report.contains("RECOMMENDATIONS"));
        assert!(report.contains("ANVIL_SSL_VERIFY=false"));
        assert!(diag.issues.iter().any(|issue| issue.contains("does not exist")));
    }

    #[test]
    fn test_record_connection_failure() {
        let mut diag = TlsDiagnostics::from_lookup("example.com", lookup(&[]));
        diag.record_connection(Err("invalid peer certificate: UnknownIssuer".into()));

        assert!(diag.issues.iter().any(|issue| issue.contains("Missing intermediate")));
        assert!(diag.to_string().contains("Connection: FAILED"));
    }

    #[test]
    fn test_is_tls_error() {
        assert!(is_tls_error("certificate verify failed"));
        assert!(is_tls_error("TLS handshake eof"));
        assert!(!is_tls_error("Connection refused"));
    }
}
