//! Command tokens understood by the robot firmware.
//!
//! Each token travels as a single ASCII line. There is no acknowledgement;
//! a press sends the start token and the matching release sends the stop
//! token.

use strum::{Display, EnumString, IntoStaticStr};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, IntoStaticStr)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum Command {
   Forward,
   Backward,
   Left,
   Right,
   Stop,
   #[strum(serialize = "BTN_A_ON")]
   BtnAOn,
   #[strum(serialize = "BTN_A_OFF")]
   BtnAOff,
   #[strum(serialize = "BTN_B_ON")]
   BtnBOn,
   #[strum(serialize = "BTN_B_OFF")]
   BtnBOff,
   #[strum(serialize = "BTN_X_ON")]
   BtnXOn,
   #[strum(serialize = "BTN_X_OFF")]
   BtnXOff,
   #[strum(serialize = "BTN_Y_ON")]
   BtnYOn,
   #[strum(serialize = "BTN_Y_OFF")]
   BtnYOff,
   /// Starts the robot's camera stream
   #[strum(serialize = "INIT_CAM")]
   InitCam,
}

impl Command {
   pub fn as_str(self) -> &'static str {
      self.into()
   }
}

/// A control on the remote: D-pad directions and the four action buttons.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
pub enum Control {
   #[strum(serialize = "up")]
   Up,
   #[strum(serialize = "down")]
   Down,
   #[strum(serialize = "left")]
   Left,
   #[strum(serialize = "right")]
   Right,
   #[strum(to_string = "A", serialize = "a")]
   A,
   #[strum(to_string = "B", serialize = "b")]
   B,
   #[strum(to_string = "X", serialize = "x")]
   X,
   #[strum(to_string = "Y", serialize = "y")]
   Y,
}

impl Control {
   pub const fn press(self) -> Command {
      match self {
         Self::Up => Command::Forward,
         Self::Down => Command::Backward,
         Self::Left => Command::Left,
         Self::Right => Command::Right,
         Self::A => Command::BtnAOn,
         Self::B => Command::BtnBOn,
         Self::X => Command::BtnXOn,
         Self::Y => Command::BtnYOn,
      }
   }

   pub const fn release(self) -> Command {
      match self {
         Self::Up | Self::Down | Self::Left | Self::Right => Command::Stop,
         Self::A => Command::BtnAOff,
         Self::B => Command::BtnBOff,
         Self::X => Command::BtnXOff,
         Self::Y => Command::BtnYOff,
      }
   }
}

#[cfg(test)]
mod tests {
   use std::str::FromStr;

   use super::*;

   #[test]
   fn test_tokens_match_firmware() {
      assert_eq!(Command::Forward.as_str(), "FORWARD");
      assert_eq!(Command::Stop.to_string(), "STOP");
      assert_eq!(Command::BtnAOn.as_str(), "BTN_A_ON");
      assert_eq!(Command::BtnYOff.as_str(), "BTN_Y_OFF");
      assert_eq!(Command::from_str("BTN_X_ON").unwrap(), Command::BtnXOn);
      assert_eq!(Command::InitCam.as_str(), "INIT_CAM");
      assert_eq!(Command::from_str("INIT_CAM").unwrap(), Command::InitCam);
      assert!(Command::from_str("JUMP").is_err());
   }

   #[test]
   fn test_dpad_release_stops() {
      for control in [Control::Up, Control::Down, Control::Left, Control::Right] {
         assert_eq!(control.release(), Command::Stop);
      }
      assert_eq!(Control::Down.press(), Command::Backward);
   }

   #[test]
   fn test_buttons_toggle() {
      let b = Control::from_str("b").unwrap();
      assert_eq!(b, Control::B);
      assert_eq!(b.press().as_str(), "BTN_B_ON");
      assert_eq!(b.release().as_str(), "BTN_B_OFF");
      assert_eq!(Control::from_str("up").unwrap().press(), Command::Forward);
   }
}
