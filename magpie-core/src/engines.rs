//! Dark web search engine catalog
//!
//! Static descriptors for the onion search engines magpie queries. Entries
//! are immutable; health state lives in the crawl layer's registry cache.

use serde::{Deserialize, Serialize};

/// A queryable onion search engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineDescriptor {
    /// Stable identifier
    pub id: &'static str,
    /// Human-readable name
    pub name: &'static str,
    /// URL template with a {query} placeholder
    pub url_template: &'static str,
    /// Name of the query parameter in the template
    pub query_param: &'static str,
    /// Whether this engine is currently in rotation
    pub enabled: bool,
    /// Scheduling priority, lower is higher
    pub priority: u8,
}

impl EngineDescriptor {
    /// Render the search URL for a query
    pub fn build_url(&self, query: &str) -> String {
        self.url_template.replace("{query}", &urlencoded(query))
    }
}

/// URL-encode a query string
fn urlencoded(s: &str) -> String {
    s.chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' | '.' | '~' => c.to_string(),
            ' ' => "+".to_string(),
            _ => format!("%{:02X}", c as u8),
        })
        .collect()
}

/// The fixed engine catalog
pub static ENGINE_CATALOG: &[EngineDescriptor] = &[
    EngineDescriptor {
        id: "ahmia",
        name: "Ahmia",
        url_template: "http://juhanurmihxlp77nkq76byazcldy2hlmovfu2epvl5ankdibsot4csyd.onion/search/?q={query}",
        query_param: "q",
        enabled: true,
        priority: 1,
    },
    EngineDescriptor {
        id: "onionland",
        name: "OnionLand",
        url_template: "http://3bbad7fauom4d6sgppalyqddsqbf5u5p56b5k5uk2zxsy3d6ey2jobad.onion/search?q={query}",
        query_param: "q",
        enabled: true,
        priority: 1,
    },
    EngineDescriptor {
        id: "torgle",
        name: "Torgle",
        url_template: "http://iy3544gmoeclh5de6gez2256v6pjh4omhpqdh2wpeeppjtvqmjhkfwad.onion/torgle/?query={query}",
        query_param: "query",
        enabled: true,
        priority: 1,
    },
    EngineDescriptor {
        id: "darkhunt",
        name: "DarkHunt",
        url_template: "http://darkhuntyla64h75a3re5e2l3367lqn7ltmdzpgmr6b4nbz3q2iaxrid.onion/search?q={query}",
        query_param: "q",
        enabled: true,
        priority: 2,
    },
    EngineDescriptor {
        id: "amnesia",
        name: "Amnesia",
        url_template: "http://amnesia7u5odx5xbwtpnqk3edybgud5bmiagu75bnqx2crntw5kry7ad.onion/search?query={query}",
        query_param: "query",
        enabled: true,
        priority: 2,
    },
    EngineDescriptor {
        id: "kaizer",
        name: "Kaizer",
        url_template: "http://kaizerwfvp5gxu6cppibp7jhcqptavq3iqef66wbxenh6a2fklibdvid.onion/search?q={query}",
        query_param: "q",
        enabled: true,
        priority: 2,
    },
    EngineDescriptor {
        id: "anima",
        name: "Anima",
        url_template: "http://anima4ffe27xmakwnseih3ic2y7y3l6e7fucwk4oerdn4odf7k74tbid.onion/search?q={query}",
        query_param: "q",
        enabled: true,
        priority: 2,
    },
    EngineDescriptor {
        id: "tornado",
        name: "Tornado",
        url_template: "http://tornadoxn3viscgz647shlysdy7ea5zqzwda7hierekeuokh5eh5b3qd.onion/search?q={query}",
        query_param: "q",
        enabled: true,
        priority: 2,
    },
    EngineDescriptor {
        id: "tornet",
        name: "TorNet",
        url_template: "http://tornetupfu7gcgidt33ftnungxzyfq2pygui5qdoyss34xbgx2qruzid.onion/search?q={query}",
        query_param: "q",
        enabled: true,
        priority: 2,
    },
    EngineDescriptor {
        id: "torland",
        name: "Torland",
        url_template: "http://torlbmqwtudkorme6prgfpmsnile7ug2zm4u3ejpcncxuhpu4k2j4kyd.onion/index.php?a=search&q={query}",
        query_param: "q",
        enabled: true,
        priority: 2,
    },
    EngineDescriptor {
        id: "findtor",
        name: "FindTor",
        url_template: "http://findtorroveq5wdnipkaojfpqulxnkhblymc7aramjzajcvpptd4rjqd.onion/search?q={query}",
        query_param: "q",
        enabled: true,
        priority: 2,
    },
    EngineDescriptor {
        id: "excavator",
        name: "Excavator",
        url_template: "http://2fd6cemt4gmccflhm6imvdfvli3nf7zn6rfrwpsy7uhxrgbypvwf5fad.onion/search?query={query}",
        query_param: "query",
        enabled: true,
        priority: 2,
    },
    EngineDescriptor {
        id: "onionway",
        name: "Onionway",
        url_template: "http://oniwayzz74cv2puhsgx4dpjwieww4wdphsydqvf5q7eyz4myjvyw26ad.onion/search.php?s={query}",
        query_param: "s",
        enabled: true,
        priority: 2,
    },
    EngineDescriptor {
        id: "tor66",
        name: "Tor66",
        url_template: "http://tor66sewebgixwhcqfnp5inzp5x5uohhdy3kvtnyfxc2e5mxiuh34iid.onion/search?q={query}",
        query_param: "q",
        enabled: true,
        priority: 2,
    },
    EngineDescriptor {
        id: "oss",
        name: "OSS (Onion Search Server)",
        url_template: "http://3fzh7yuupdfyjhwt3ugzqqof6ulbcl27ecev33knxe3u7goi3vfn2qqd.onion/oss/index.php?search={query}",
        query_param: "search",
        enabled: true,
        priority: 2,
    },
];

/// All enabled engines in catalog order
pub fn enabled_engines() -> impl Iterator<Item = &'static EngineDescriptor> {
    ENGINE_CATALOG.iter().filter(|e| e.enabled)
}

/// Enabled engines sorted ascending by priority (stable within a tier)
pub fn engines_by_priority() -> Vec<&'static EngineDescriptor> {
    let mut engines: Vec<_> = enabled_engines().collect();
    engines.sort_by_key(|e| e.priority);
    engines
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_url() {
        let engine = &ENGINE_CATALOG[0];
        let url = engine.build_url("ransomware payments");
        assert!(url.contains("ransomware+payments"));
        assert!(url.ends_with(".onion/search/?q=ransomware+payments"));
    }

    #[test]
    fn test_build_url_escapes_reserved() {
        let engine = &ENGINE_CATALOG[0];
        let url = engine.build_url("a&b=c");
        assert!(url.ends_with("q=a%26b%3Dc"));
    }

    #[test]
    fn test_priority_order() {
        let engines = engines_by_priority();
        assert!(engines.len() >= 10);
        assert!(engines.windows(2).all(|w| w[0].priority <= w[1].priority));
        // Tier-1 engines come first, in catalog order
        assert_eq!(engines[0].id, "ahmia");
    }
}
