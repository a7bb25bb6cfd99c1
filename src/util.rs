const AGENT_CONFIG: &str = "AGENT_CONFIG";

const DEFAULT_CONFIG_PATH: &str = "./agent.json";

pub fn get_config_path() -> String {
    let path_from_env = std::env::var(AGENT_CONFIG);
    path_from_env.unwrap_or_else(|_| DEFAULT_CONFIG_PATH.into())
}

const AGENT_SUPPRESS_EVENTS: &str = "AGENT_SUPPRESS_EVENTS";
const AGENT_SUPPRESS_METRICS: &str = "AGENT_SUPPRESS_METRICS";
const AGENT_SUPPRESS_INVENTORY: &str = "AGENT_SUPPRESS_INVENTORY";
const AGENT_SUPPRESS_DOWNTIMES: &str = "AGENT_SUPPRESS_DOWNTIMES";

pub fn get_suppress_events() -> Option<bool> {
    get_flag(AGENT_SUPPRESS_EVENTS)
}

pub fn get_suppress_metrics() -> Option<bool> {
    get_flag(AGENT_SUPPRESS_METRICS)
}

pub fn get_suppress_inventory() -> Option<bool> {
    get_flag(AGENT_SUPPRESS_INVENTORY)
}

pub fn get_suppress_downtimes() -> Option<bool> {
    get_flag(AGENT_SUPPRESS_DOWNTIMES)
}

fn get_flag(name: &str) -> Option<bool> {
    let flag_from_env = std::env::var(name);
    flag_from_env.ok().and_then(|res| match res.as_str() {
        "1" | "true" | "TRUE" | "yes" => Some(true),
        "0" | "false" | "FALSE" | "no" => Some(false),
        _ => None,
    })
}
