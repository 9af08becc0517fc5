//! Minimal robots.txt reader.
//!
//! Only group selection and the blanket `Disallow: /` rule matter to the
//! executor; path-level rules are kept so callers can inspect them.

use std::collections::HashMap;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AgentRules {
    pub disallow: Vec<String>,
    pub allow: Vec<String>,
}

impl AgentRules {
    /// `Disallow: /` with no `Allow` carve-outs
    pub fn is_blanket_disallow(&self) -> bool {
        self.allow.is_empty() && self.disallow.iter().any(|d| d == "/")
    }
}

/// Parsed robots.txt grouped by user-agent token
#[derive(Debug, Clone, Default)]
pub struct RobotsPolicy {
    rules: HashMap<String, AgentRules>,
    default_rules: AgentRules,
}

impl RobotsPolicy {
    pub fn parse(content: &str) -> Self {
        let mut policy = Self::default();
        let mut current_agents: Vec<String> = Vec::new();
        let mut current_rules = AgentRules::default();
        // A user-agent line following rules starts a new group
        let mut in_rules = false;

        for line in content.lines() {
            let line = match line.split_once('#') {
                Some((before, _)) => before,
                None => line,
            }
            .trim();
            if line.is_empty() {
                continue;
            }

            let Some((directive, value)) = line.split_once(':') else {
                continue;
            };
            let value = value.trim();

            match directive.trim().to_ascii_lowercase().as_str() {
                "user-agent" => {
                    if in_rules {
                        policy.store_group(&current_agents, &current_rules);
                        current_agents.clear();
                        current_rules = AgentRules::default();
                        in_rules = false;
                    }
                    current_agents.push(value.to_ascii_lowercase());
                }
                "disallow" => {
                    in_rules = true;
                    if !value.is_empty() {
                        current_rules.disallow.push(value.to_string());
                    }
                }
                "allow" => {
                    in_rules = true;
                    if !value.is_empty() {
                        current_rules.allow.push(value.to_string());
                    }
                }
                _ => {}
            }
        }
        policy.store_group(&current_agents, &current_rules);

        policy
    }

    fn store_group(&mut self, agents: &[String], rules: &AgentRules) {
        for agent in agents {
            let entry = if agent == "*" {
                &mut self.default_rules
            } else {
                self.rules.entry(agent.clone()).or_default()
            };
            entry.disallow.extend(rules.disallow.iter().cloned());
            entry.allow.extend(rules.allow.iter().cloned());
        }
    }

    /// Rules of the group that applies to `user_agent`, falling back to `*`
    pub fn rules_for(&self, user_agent: &str) -> &AgentRules {
        let agent = user_agent.to_ascii_lowercase();
        self.rules
            .get(&agent)
            .or_else(|| {
                self.rules
                    .iter()
                    .filter(|(token, _)| agent.contains(token.as_str()))
                    .max_by_key(|(token, _)| token.len())
                    .map(|(_, rules)| rules)
            })
            .unwrap_or(&self.default_rules)
    }

    pub fn is_blanket_disallow(&self, user_agent: &str) -> bool {
        self.rules_for(user_agent).is_blanket_disallow()
    }
}
