// housekeeper/src/backup/encryption.rs
use age::secrecy::SecretString;
use age::x25519;
use std::io::{self, Write};
use std::iter;

use crate::errors::{HousekeeperError, Result};

/// Who may decrypt an archive. Recipient keys and a passphrase never mix.
#[derive(Debug, Clone, Default)]
pub enum Encryption {
    #[default]
    None,
    Recipients(Vec<x25519::Recipient>),
    Passphrase(SecretString),
}

impl Encryption {
    pub fn is_enabled(&self) -> bool {
        !matches!(self, Encryption::None)
    }

    /// Wraps `output` so that everything written to the wrapper is encrypted.
    /// Without recipients the wrapper passes bytes straight through.
    pub fn wrap<W: Write>(&self, output: W) -> Result<EncryptedWriter<W>> {
        let encryptor = match self {
            Encryption::None => return Ok(EncryptedWriter::Plain(output)),
            Encryption::Recipients(recipients) => age::Encryptor::with_recipients(
                recipients.iter().map(|r| r as &dyn age::Recipient),
            )
            .map_err(|e| HousekeeperError::Encryption(e.to_string()))?,
            Encryption::Passphrase(passphrase) => {
                let recipient = age::scrypt::Recipient::new(passphrase.clone());
                age::Encryptor::with_recipients(iter::once(&recipient as &dyn age::Recipient))
                    .map_err(|e| HousekeeperError::Encryption(e.to_string()))?
            }
        };

        let stream = encryptor
            .wrap_output(output)
            .map_err(|e| HousekeeperError::Encryption(format!("failed to write age header: {}", e)))?;
        Ok(EncryptedWriter::Age(stream))
    }
}

pub enum EncryptedWriter<W: Write> {
    Plain(W),
    Age(age::stream::StreamWriter<W>),
}

impl<W: Write> EncryptedWriter<W> {
    /// Writes the final ciphertext chunk and hands back the wrapped writer.
    pub fn finish(self) -> io::Result<W> {
        match self {
            EncryptedWriter::Plain(inner) => Ok(inner),
            EncryptedWriter::Age(stream) => stream.finish(),
        }
    }
}

impl<W: Write> Write for EncryptedWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            EncryptedWriter::Plain(inner) => inner.write(buf),
            EncryptedWriter::Age(stream) => stream.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            EncryptedWriter::Plain(inner) => inner.flush(),
            EncryptedWriter::Age(stream) => stream.flush(),
        }
    }
}
