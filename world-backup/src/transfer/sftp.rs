//! SFTP transport over libssh2.

use super::{remote_file_path, resolve, RemoteTransport};
use crate::config::UploadConfig;
use crate::utils::errors::UploadError;
use ssh2::{Session, Sftp};
use std::fs::File;
use std::io::BufReader;
use std::net::TcpStream;
use std::path::Path;
use std::time::Duration;
use tracing::debug;

const BUFFER_SIZE: usize = 1024 * 1024;

/// Password or private-key authenticated SFTP session.
///
/// The server's host key is not checked against `known_hosts`.
pub struct SftpTransport {
    config: UploadConfig,
    session: Option<Session>,
    sftp: Option<Sftp>,
}

impl SftpTransport {
    pub fn new(config: UploadConfig) -> Self {
        Self {
            config,
            session: None,
            sftp: None,
        }
    }

    fn authenticate(&self, session: &Session) -> Result<(), UploadError> {
        let user = self.config.user.as_str();
        if self.config.use_key_auth {
            let passphrase = self.config.private_key_passphrase.as_str();
            let passphrase = (!passphrase.is_empty()).then_some(passphrase);
            session.userauth_pubkey_file(user, None, &self.config.private_key_path, passphrase)?;
        } else {
            session.userauth_password(user, &self.config.password)?;
        }

        if !session.authenticated() {
            return Err(UploadError::Authentication(format!(
                "SFTP server rejected credentials for {}",
                user
            )));
        }
        Ok(())
    }
}

impl RemoteTransport for SftpTransport {
    fn connect(&mut self) -> Result<(), UploadError> {
        let addr = resolve(&self.config.host, self.config.port)?;
        let timeout = Duration::from_secs(self.config.timeout_secs);

        let tcp = TcpStream::connect_timeout(&addr, timeout)?;
        tcp.set_read_timeout(Some(timeout))?;
        tcp.set_write_timeout(Some(timeout))?;

        let mut session = Session::new()?;
        session.set_tcp_stream(tcp);
        session.set_timeout(u32::try_from(timeout.as_millis()).unwrap_or(u32::MAX));
        session.handshake()?;
        self.authenticate(&session)?;

        self.sftp = Some(session.sftp()?);
        self.session = Some(session);
        debug!(host = %self.config.host, port = self.config.port, "SFTP session established");
        Ok(())
    }

    fn put(&mut self, local: &Path) -> Result<bool, UploadError> {
        let sftp = self.sftp.as_ref().ok_or(UploadError::NotConnected)?;
        let file_name = super::file_name(local)?;
        let remote = remote_file_path(&self.config.remote_path, &file_name);

        let mut reader = BufReader::with_capacity(BUFFER_SIZE, File::open(local)?);
        let mut remote_file = sftp.create(Path::new(&remote))?;
        std::io::copy(&mut reader, &mut remote_file)?;
        remote_file.close()?;
        Ok(true)
    }

    fn delete(&mut self, file_name: &str) -> Result<(), UploadError> {
        let sftp = self.sftp.as_ref().ok_or(UploadError::NotConnected)?;
        let remote = remote_file_path(&self.config.remote_path, file_name);
        sftp.unlink(Path::new(&remote))?;
        Ok(())
    }

    fn disconnect(&mut self) -> Result<(), UploadError> {
        self.sftp.take();
        if let Some(session) = self.session.take() {
            session.disconnect(None, "upload finished", None)?;
        }
        Ok(())
    }
}
