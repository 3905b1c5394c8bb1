//! Demonstration CLI for the latchkey library: key management, signing and
//! a local end-to-end session walk-through. Secrets are printed as hex on
//! stdout; treat the output of `keygen` like any other private key file.

use anyhow::{anyhow, bail, Context, Result};
use data_encoding::HEXLOWER;
use latchkey::{
    init, stretch_password, verify, verify_client_proof, Client, PublicKey, Server, ServerSecret,
    StretchParams, Verifier, PROTOCOL_VERSION, SERVER_SECRET_LEN, SIGNATURE_LEN,
};

fn usage() -> ! {
    eprintln!("usage: latchkey <command> [args]");
    eprintln!();
    eprintln!("  keygen                                  generate a server identity");
    eprintln!("  pubkey <secret-hex>                     print the public key for a secret");
    eprintln!("  sign <secret-hex> <message>             sign a message");
    eprintln!("  verify <public-hex> <sig-hex> <message> verify a signature");
    eprintln!("  demo                                    run a local handshake + login");
    std::process::exit(2);
}

fn decode_fixed<const N: usize>(label: &str, hex: &str) -> Result<[u8; N]> {
    let bytes = HEXLOWER
        .decode(hex.as_bytes())
        .with_context(|| format!("{label} is not valid hex"))?;
    let array: [u8; N] = bytes
        .try_into()
        .map_err(|_| anyhow!("{label} must be {N} bytes"))?;
    Ok(array)
}

fn load_server(secret_hex: &str) -> Result<Server> {
    let blob: [u8; SERVER_SECRET_LEN] = decode_fixed("secret", secret_hex)?;
    Server::load_secret(&ServerSecret::from_bytes(&blob), None)
}

fn cmd_keygen() -> Result<()> {
    let server = Server::generate(None)?;
    println!("secret: {}", HEXLOWER.encode(server.save_secret().as_bytes()));
    println!("public: {}", HEXLOWER.encode(server.public_key().as_bytes()));
    Ok(())
}

fn cmd_pubkey(secret_hex: &str) -> Result<()> {
    let server = load_server(secret_hex)?;
    println!("{}", HEXLOWER.encode(server.public_key().as_bytes()));
    Ok(())
}

fn cmd_sign(secret_hex: &str, message: &str) -> Result<()> {
    let server = load_server(secret_hex)?;
    let signature = server.sign(message.as_bytes())?;
    println!("{}", HEXLOWER.encode(&signature));
    Ok(())
}

fn cmd_verify(public_hex: &str, sig_hex: &str, message: &str) -> Result<()> {
    let public = PublicKey::from_bytes(&decode_fixed("public key", public_hex)?)?;
    let signature: [u8; SIGNATURE_LEN] = decode_fixed("signature", sig_hex)?;
    verify(message.as_bytes(), &public, &signature)?;
    println!("ok");
    Ok(())
}

/// Runs the whole protocol locally: handshake, signature, password login.
fn cmd_demo() -> Result<()> {
    let mut server = Server::generate(Some(b"demo server"))?;
    let public = server.public_key();
    println!("server public key : {}", HEXLOWER.encode(public.as_bytes()));

    // Handshake.
    let (mut client, request) = Client::generate(Some(b"demo client"))?;
    let (response, server_key) = server.handshake(&request)?;
    let client_key = client.finish(&public, &response)?;
    println!("server session key: {}", HEXLOWER.encode(server_key.as_bytes()));
    println!("client session key: {}", HEXLOWER.encode(client_key.as_bytes()));
    if server_key.as_bytes() != client_key.as_bytes() {
        bail!("session keys disagree");
    }

    // Signature over the response, checked by the client.
    let signature = server.sign(&response)?;
    verify(&response, &public, &signature)?;
    println!("response signature verified");

    // Password login with light costs so the demo stays snappy.
    let params = StretchParams {
        m_cost: 8192,
        t_cost: 1,
        lanes: 1,
    };
    let username = b"alice";
    let key = stretch_password(username, b"demo", b"correct horse battery staple", &params)?;
    let verifier = Verifier::generate(&key, &params)?;
    let (challenge_secret, challenge) = server.password_challenge(username, &verifier)?;
    let (check, proof) = client.password_proof(username, &challenge, &key)?;
    let server_proof = verify_client_proof(&challenge_secret, &proof)?;
    check.confirm(&server_proof)?;
    println!("password login verified both ways");
    Ok(())
}

fn main() -> Result<()> {
    init(PROTOCOL_VERSION)?;

    let args: Vec<String> = std::env::args().skip(1).collect();
    let args: Vec<&str> = args.iter().map(String::as_str).collect();
    match args[..] {
        ["keygen"] => cmd_keygen(),
        ["pubkey", secret] => cmd_pubkey(secret),
        ["sign", secret, message] => cmd_sign(secret, message),
        ["verify", public, sig, message] => cmd_verify(public, sig, message),
        ["demo"] => cmd_demo(),
        _ => usage(),
    }
}
