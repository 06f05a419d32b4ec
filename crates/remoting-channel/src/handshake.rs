use remoting_proto::{Capability, Mode, BINARY_MODE_PREAMBLE, CAPABILITY_PREAMBLE, TEXT_MODE_PREAMBLE};
use tokio::io::{AsyncRead, AsyncReadExt as _, AsyncWrite, AsyncWriteExt as _};

use crate::ChannelError;

/// Result of a completed handshake: the mode both sides ended up agreeing on
/// and the capability bits the peer advertised.
pub(crate) struct Handshake {
    pub(crate) mode: Mode,
    pub(crate) peer_capability: Capability,
}

/// Writes our preamble and capability bits, then scans the incoming stream
/// for the peer's own preamble.
///
/// Real deployments often sit behind a connection that prints unrelated
/// banner lines before the actual protocol starts (an SSH MOTD, a proxy's
/// own greeting). Bytes read before the matching preamble is found are
/// appended to `header_sink` rather than discarded, mirroring how a
/// tolerant handshake lets a caller inspect what it skipped over.
pub(crate) async fn perform<S>(
    io: &mut S,
    local_mode: Mode,
    header_sink: &mut Vec<u8>,
) -> Result<Handshake, ChannelError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    io.write_all(CAPABILITY_PREAMBLE)
        .await
        .map_err(ChannelError::transport)?;
    let local_capability = Capability::local();
    let encoded = local_capability.encode();
    io.write_all(&(encoded.len() as u16).to_be_bytes())
        .await
        .map_err(ChannelError::transport)?;
    io.write_all(&encoded).await.map_err(ChannelError::transport)?;

    // A side with a preset mode writes that preamble. A negotiating side has
    // no preamble of its own to write per spec §4.1 ("adopts the peer's mode
    // and echoes it back") — but if *both* sides are negotiating, neither
    // would ever write a mode preamble and both would block forever waiting
    // for the other. Break that tie by having a negotiating side propose
    // binary mode up front; if the peer turns out to have proposed or
    // preset a different mode, the scan below still adopts whatever the
    // peer actually sent.
    io.write_all(local_mode.preamble().unwrap_or(BINARY_MODE_PREAMBLE))
        .await
        .map_err(ChannelError::transport)?;
    io.flush().await.map_err(ChannelError::transport)?;

    // Capability and mode preambles are matched against in a single
    // simultaneous scan, exactly as the spec describes: the reader doesn't
    // commit to "this must be the capability preamble" ahead of time, so a
    // caller-supplied banner (an outer protocol's greeting line, say) that
    // happens to share a prefix with one of them doesn't get misread.
    let needles: &[&[u8]] = match local_mode {
        Mode::Negotiate => &[CAPABILITY_PREAMBLE, BINARY_MODE_PREAMBLE, TEXT_MODE_PREAMBLE],
        _ => &[CAPABILITY_PREAMBLE],
    };
    let which = scan_for_any(io, needles, header_sink).await?;
    if which != 0 {
        // A peer in NEGOTIATE mode that has no pending capability bits to
        // send may jump straight to its mode preamble; nothing to decode.
        return Ok(Handshake {
            mode: mode_from_preamble(needles[which]),
            peer_capability: Capability::NONE,
        });
    }

    let mut len_buf = [0u8; 2];
    io.read_exact(&mut len_buf).await.map_err(ChannelError::transport)?;
    let len = u16::from_be_bytes(len_buf) as usize;
    let mut bits_buf = vec![0u8; len];
    io.read_exact(&mut bits_buf).await.map_err(ChannelError::transport)?;
    let peer_capability = Capability::decode(&bits_buf);

    let mode_needles: &[&[u8]] = match local_mode {
        Mode::Negotiate => &[BINARY_MODE_PREAMBLE, TEXT_MODE_PREAMBLE],
        other => {
            let preamble = other.preamble().expect("non-negotiate mode always has a preamble");
            scan_for_any(io, &[preamble], header_sink).await?;
            return Ok(Handshake { mode: other, peer_capability });
        }
    };
    let which = scan_for_any(io, mode_needles, header_sink).await?;
    Ok(Handshake {
        mode: mode_from_preamble(mode_needles[which]),
        peer_capability,
    })
}

/// Maps a matched preamble back to the [`Mode`] it announces. The two scans
/// above pass needle slices of different lengths and orderings, so the mode
/// is recovered from the bytes actually matched rather than from a
/// positional index convention that would have to stay in sync across both
/// call sites.
fn mode_from_preamble(preamble: &[u8]) -> Mode {
    if preamble == BINARY_MODE_PREAMBLE {
        Mode::Binary
    } else {
        debug_assert_eq!(preamble, TEXT_MODE_PREAMBLE);
        Mode::Text
    }
}

/// Reads byte-by-byte until one of `needles` is found as a contiguous
/// subsequence, matching against all of them at once. Bytes that end up not
/// contributing to the eventual match are teed to `header_sink`. Returns the
/// index into `needles` of whichever one matched.
///
/// Needles are expected to share a common prefix (as the three handshake
/// preambles do: `<===[JENKINS REMOTING ...`), so a byte can keep several
/// candidates alive at once; when all of them diverge from what's been read
/// so far, the longest suffix that is still a valid prefix of some needle is
/// kept and everything before it is flushed to `header_sink`.
async fn scan_for_any<S>(io: &mut S, needles: &[&[u8]], header_sink: &mut Vec<u8>) -> Result<usize, ChannelError>
where
    S: AsyncRead + Unpin,
{
    let mut buf: Vec<u8> = Vec::new();
    let mut byte = [0u8; 1];

    loop {
        io.read_exact(&mut byte).await.map_err(ChannelError::transport)?;
        buf.push(byte[0]);

        if let Some(i) = needles.iter().position(|n| n.as_ref() == buf.as_slice()) {
            return Ok(i);
        }

        if needles.iter().any(|n| n.len() >= buf.len() && n[..buf.len()] == buf[..]) {
            continue;
        }

        let keep = longest_matching_suffix(&buf, needles);
        let drop = buf.len() - keep;
        header_sink.extend_from_slice(&buf[..drop]);
        buf.drain(..drop);
    }
}

/// Longest suffix of `buf` that is still a valid prefix of some needle.
fn longest_matching_suffix(buf: &[u8], needles: &[&[u8]]) -> usize {
    for start in 0..=buf.len() {
        let suffix = &buf[start..];
        if needles.iter().any(|n| n.len() >= suffix.len() && n[..suffix.len()] == *suffix) {
            return suffix.len();
        }
    }
    0
}
