use rand::prelude::*;

/// Desktop browser user agents for media hosts that reject non-browser clients.
pub struct UserAgentGenerator {
    rng: ThreadRng,
}

impl Default for UserAgentGenerator {
    fn default() -> Self {
        Self::new()
    }
}

const OS_LIST: [&str; 5] = [
    "Windows NT 10.0; Win64; x64",
    "Macintosh; Intel Mac OS X 10_15_7",
    "Macintosh; Intel Mac OS X 10_14_6",
    "X11; Linux x86_64",
    "X11; Ubuntu; Linux x86_64",
];

impl UserAgentGenerator {
    pub fn new() -> Self {
        Self { rng: rand::rng() }
    }

    pub fn generate(&mut self) -> String {
        match self.rng.random_range(0..3) {
            0 => self.generate_chrome(),
            1 => self.generate_firefox(),
            _ => self.generate_edge(),
        }
    }

    fn pick(&mut self, items: &[&'static str]) -> &'static str {
        items.choose(&mut self.rng).copied().unwrap_or(items[0])
    }

    fn generate_chrome(&mut self) -> String {
        let os = self.pick(&OS_LIST);
        let version = self.pick(&["124.0.0.0", "123.0.0.0", "122.0.0.0", "121.0.0.0"]);
        format!(
            "Mozilla/5.0 ({os}) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/{version} Safari/537.36"
        )
    }

    fn generate_firefox(&mut self) -> String {
        let os = self.pick(&[
            "Windows NT 10.0; Win64; x64",
            "Macintosh; Intel Mac OS X 10.15",
            "X11; Linux x86_64",
        ]);
        let version = self.pick(&["125.0", "124.0", "123.0"]);
        format!("Mozilla/5.0 ({os}; rv:{version}) Gecko/20100101 Firefox/{version}")
    }

    fn generate_edge(&mut self) -> String {
        let os = self.pick(&OS_LIST);
        let version = self.pick(&["124.0.0.0", "123.0.0.0", "122.0.0.0"]);
        format!(
            "Mozilla/5.0 ({os}) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/{version} Safari/537.36 Edg/{version}"
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_user_agents() {
        let mut generator = UserAgentGenerator::new();
        for _ in 0..50 {
            let ua = generator.generate();
            assert!(ua.starts_with("Mozilla/5.0"));
            assert!(ua.contains("Chrome") || ua.contains("Firefox"));
            assert!(!ua.contains("Mobile"));
        }
    }
}
