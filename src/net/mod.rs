// Vibration Node: Network Collaborators
//
// Wi-Fi station, SNTP and the MQTT/TLS client.  Each setup call blocks until
// ready or its deadline passes, and reports failure tagged with its stage.

pub mod mqtt;
pub mod sntp;
pub mod wifi;
