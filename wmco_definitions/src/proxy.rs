use std::env;

/// Cluster-wide proxy variables, read once from the operator's environment at
/// startup and propagated to every agent service on the hosts.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct ProxySettings {
    pub http_proxy: Option<String>,
    pub https_proxy: Option<String>,
    pub no_proxy: Option<String>,
}

impl ProxySettings {
    /// Read `HTTP_PROXY`/`HTTPS_PROXY`/`NO_PROXY` from the environment.
    ///
    /// Empty variables count as unset.
    pub fn from_env() -> ProxySettings {
        let read = |k: &str| env::var(k).ok().filter(|v| !v.is_empty());
        ProxySettings {
            http_proxy: read("HTTP_PROXY"),
            https_proxy: read("HTTPS_PROXY"),
            no_proxy: read("NO_PROXY"),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.http_proxy.is_none() && self.https_proxy.is_none() && self.no_proxy.is_none()
    }

    /// The `NO_PROXY` list in the semicolon form Windows services expect
    pub fn windows_no_proxy(&self) -> Option<String> {
        self.no_proxy.as_ref().map(|np| {
            np.split(',')
                .map(str::trim)
                .filter(|e| !e.is_empty())
                .collect::<Vec<_>>()
                .join(";")
        })
    }

    /// Environment variable pairs to declare on each installed service
    pub fn service_env(&self) -> Vec<(String, String)> {
        let mut vars = vec![];
        if let Some(p) = &self.http_proxy {
            vars.push(("HTTP_PROXY".to_string(), p.clone()));
        }
        if let Some(p) = &self.https_proxy {
            vars.push(("HTTPS_PROXY".to_string(), p.clone()));
        }
        if let Some(np) = self.windows_no_proxy() {
            vars.push(("NO_PROXY".to_string(), np));
        }
        vars
    }
}

#[cfg(test)]
mod tests {
    use super::ProxySettings;

    #[test]
    fn no_proxy_translation() {
        let p = ProxySettings {
            http_proxy: Some("http://proxy:3128".into()),
            https_proxy: None,
            no_proxy: Some("localhost, .cluster.local,10.0.0.0/8".into()),
        };
        assert_eq!(
            p.windows_no_proxy().unwrap(),
            "localhost;.cluster.local;10.0.0.0/8"
        );
        let env = p.service_env();
        assert_eq!(env.len(), 2);
        assert_eq!(env[0].0, "HTTP_PROXY");
    }

    #[test]
    fn empty_settings() {
        let p = ProxySettings::default();
        assert!(p.is_empty());
        assert!(p.service_env().is_empty());
    }
}
