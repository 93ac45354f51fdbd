pub mod cisa;
pub mod epss;
pub mod metasploit;
pub mod misp;
