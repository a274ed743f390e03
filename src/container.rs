//! Proxy target parsed from container labels

use std::collections::HashMap;

const LABEL_DOMAINS: &str = "cloudanchor.domains";
const LABEL_ADDR: &str = "cloudanchor.addr";

/// A running container that asked to be proxied.
///
/// Built once from the labels a container was started with and never
/// modified afterwards; the record is dropped when the container dies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Container {
    pub id: String,
    pub name: String,
    /// Domain names served by this container, in label order.
    pub domains: Vec<String>,
    /// `host:port` of the backend the proxy should forward to.
    pub addr: String,
}

impl Container {
    /// Attempt to build a container record from its label set.
    ///
    /// Returns `None` when either required label is missing or fails
    /// validation, in which case the container is simply ignored.
    pub fn from_labels(
        id: &str,
        name: &str,
        labels: &HashMap<String, String>,
    ) -> Option<Container> {
        let domains = parse_domains(labels.get(LABEL_DOMAINS)?)?;
        let addr = labels.get(LABEL_ADDR)?;
        if !valid_addr(addr) {
            return None;
        }
        Some(Container {
            id: id.to_string(),
            name: name.to_string(),
            domains,
            addr: addr.to_string(),
        })
    }
}

/// Domains are comma-separated; excess whitespace is trimmed. An empty
/// item invalidates the whole label.
fn parse_domains(value: &str) -> Option<Vec<String>> {
    let mut domains = Vec::new();
    for item in value.split(',') {
        let item = item.trim();
        if item.is_empty() {
            return None;
        }
        domains.push(item.to_string());
    }
    Some(domains)
}

fn valid_addr(addr: &str) -> bool {
    match addr.rsplit_once(':') {
        Some((host, port)) => {
            !host.is_empty() && port.parse::<u16>().map(|p| p > 0).unwrap_or(false)
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_from_labels() {
        let cont = Container::from_labels(
            "c1",
            "web",
            &labels(&[
                ("cloudanchor.domains", "example.test"),
                ("cloudanchor.addr", "10.0.0.5:8080"),
            ]),
        )
        .unwrap();
        assert_eq!(cont.id, "c1");
        assert_eq!(cont.name, "web");
        assert_eq!(cont.domains, vec!["example.test"]);
        assert_eq!(cont.addr, "10.0.0.5:8080");
    }

    #[test]
    fn test_domains_are_trimmed_and_ordered() {
        let cont = Container::from_labels(
            "c1",
            "web",
            &labels(&[
                ("cloudanchor.domains", " a.test ,b.test,  c.test"),
                ("cloudanchor.addr", "backend:3000"),
            ]),
        )
        .unwrap();
        assert_eq!(cont.domains, vec!["a.test", "b.test", "c.test"]);
    }

    #[test]
    fn test_missing_labels() {
        assert!(Container::from_labels("c1", "web", &labels(&[])).is_none());
        assert!(Container::from_labels(
            "c1",
            "web",
            &labels(&[("cloudanchor.domains", "a.test")])
        )
        .is_none());
        assert!(Container::from_labels(
            "c1",
            "web",
            &labels(&[("cloudanchor.addr", "10.0.0.5:8080")])
        )
        .is_none());
    }

    #[test]
    fn test_empty_domain_item_rejected() {
        for value in ["", "a.test,,b.test", "a.test, ", ","] {
            assert!(
                Container::from_labels(
                    "c1",
                    "web",
                    &labels(&[
                        ("cloudanchor.domains", value),
                        ("cloudanchor.addr", "10.0.0.5:8080"),
                    ])
                )
                .is_none(),
                "expected rejection for {value:?}"
            );
        }
    }

    #[test]
    fn test_invalid_addr_rejected() {
        for addr in ["", "backend", ":8080", "backend:", "backend:0", "backend:http"] {
            assert!(
                Container::from_labels(
                    "c1",
                    "web",
                    &labels(&[
                        ("cloudanchor.domains", "a.test"),
                        ("cloudanchor.addr", addr),
                    ])
                )
                .is_none(),
                "expected rejection for {addr:?}"
            );
        }
    }
}
